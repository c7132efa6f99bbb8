// SPDX-License-Identifier: MIT OR Apache-2.0

//! The fold from graph to team state.
//!
//! Links are applied in the deterministic order produced by the graph
//! sequencer. For every link the author's signature is checked against the
//! device key active in the state reduced so far, then the action's
//! validator runs, then the pure transform. A validator failure rejects the
//! link and halts the fold at that point; a signature failure is fatal for
//! the whole graph.
use std::collections::BTreeMap;

use huddle_core::graph::{Graph, GraphError, Resolver, SignedLink};
use huddle_core::{KeyScope, Lockbox};
use thiserror::Error;
use tracing::warn;

use crate::action::TeamAction;
use crate::member::Role;
use crate::state::{RootContext, TeamState};
use crate::validate::{validate, validate_root, ValidationError};

#[derive(Debug, Error)]
pub enum ReduceError {
    /// A signature did not verify; the graph cannot be trusted at all.
    #[error("graph corrupt: {0}")]
    GraphCorrupt(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Reduce a whole graph under the given resolver.
pub fn reduce<R>(graph: &Graph<TeamAction>, resolver: &R) -> Result<TeamState, ReduceError>
where
    R: Resolver<TeamAction>,
{
    let ordered = huddle_core::graph::sequence(graph, resolver)?;

    let mut state: Option<TeamState> = None;
    for hash in ordered {
        let link = graph
            .get(&hash)
            .and_then(|link| link.as_signed())
            .ok_or_else(|| ReduceError::GraphCorrupt(format!("sequenced link {hash} missing")))?;
        state = Some(apply(state, link).inspect_err(|err| {
            warn!(link = %hash, action = link.body.payload.name(), "rejected link: {err}");
        })?);
    }

    state.ok_or(ReduceError::Validation(ValidationError::MissingRoot))
}

/// Apply a single link to the state reduced so far.
pub fn apply(
    state: Option<TeamState>,
    link: &SignedLink<TeamAction>,
) -> Result<TeamState, ReduceError> {
    match state {
        None => {
            validate_root(link)?;
            verify_root_signature(link)?;
            Ok(init_state(link))
        }
        Some(state) => {
            verify_author(&state, link)?;
            validate(&state, link)?;
            Ok(transform(state, link))
        }
    }
}

/// The root link bootstraps trust: its signature verifies against the
/// founding device keys carried in its own payload.
fn verify_root_signature(link: &SignedLink<TeamAction>) -> Result<(), ReduceError> {
    let TeamAction::Root { member, .. } = &link.body.payload else {
        return Err(ValidationError::MissingRoot.into());
    };
    let device = member
        .device(&link.body.author.device_id)
        .ok_or(ValidationError::RootAuthorMismatch)?;
    link.verify(&device.keys.signing)
        .map_err(|_| ReduceError::GraphCorrupt("root link signature does not verify".to_string()))
}

/// Verify a link against the author's device signing key as known by the
/// state immediately preceding it; that key is exactly the generation
/// active when the link was written.
fn verify_author(state: &TeamState, link: &SignedLink<TeamAction>) -> Result<(), ReduceError> {
    let author = &link.body.author;
    let member = state
        .member(&author.user_name)
        .ok_or_else(|| ValidationError::AuthorNotMember(author.user_name.clone()))?;
    let device = member
        .device(&author.device_id)
        .ok_or_else(|| ValidationError::AuthorDeviceNotFound {
            user_name: author.user_name.clone(),
            device_id: author.device_id.clone(),
        })?;

    link.verify(&device.keys.signing).map_err(|_| {
        ReduceError::GraphCorrupt(format!(
            "signature by {}/{} does not verify",
            author.user_name, author.device_id
        ))
    })
}

fn init_state(link: &SignedLink<TeamAction>) -> TeamState {
    let TeamAction::Root {
        team_name,
        member,
        lockboxes,
    } = &link.body.payload
    else {
        unreachable!("validate_root admits only root actions");
    };

    TeamState {
        team_name: team_name.clone(),
        root_context: RootContext {
            team_name: team_name.clone(),
            user_name: member.user_name.clone(),
            keys: member.keys.clone(),
        },
        members: BTreeMap::from([(member.user_name.clone(), member.clone())]),
        roles: BTreeMap::from([(Role::admin().role_name.clone(), Role::admin())]),
        lockboxes: lockboxes.clone(),
        invitations: BTreeMap::new(),
        removed_members: BTreeMap::new(),
        removed_devices: BTreeMap::new(),
        servers: BTreeMap::new(),
    }
}

fn push_lockboxes(state: &mut TeamState, lockboxes: &[Lockbox]) {
    for lockbox in lockboxes {
        if !state.lockboxes.contains(lockbox) {
            state.lockboxes.push(lockbox.clone());
        }
    }
}

/// The pure effect of a validated action.
fn transform(mut state: TeamState, link: &SignedLink<TeamAction>) -> TeamState {
    let action = &link.body.payload;
    push_lockboxes(&mut state, action.lockboxes());

    match action {
        // Rejected by the validator before we get here.
        TeamAction::Root { .. } => {}

        TeamAction::AddMember { member, .. } => {
            state.members.insert(member.user_name.clone(), member.clone());
        }

        TeamAction::RemoveMember { user_name, .. } => {
            if let Some(member) = state.members.remove(user_name) {
                for (device_id, device) in &member.devices {
                    state
                        .removed_devices
                        .insert(device_id.clone(), device.clone());
                }
                state.removed_members.insert(user_name.clone(), member);
            }
        }

        TeamAction::AddRole { role, .. } => {
            state.roles.insert(role.role_name.clone(), role.clone());
        }

        TeamAction::RemoveRole { role_name } => {
            state.roles.remove(role_name);
            for member in state.members.values_mut() {
                member.roles.remove(role_name);
            }
        }

        TeamAction::AddMemberRole {
            user_name,
            role_name,
            ..
        } => {
            if let Some(member) = state.members.get_mut(user_name) {
                member.roles.insert(role_name.clone());
            }
        }

        TeamAction::RemoveMemberRole {
            user_name,
            role_name,
            ..
        } => {
            if let Some(member) = state.members.get_mut(user_name) {
                member.roles.remove(role_name);
            }
        }

        TeamAction::AddDevice {
            user_name, device, ..
        } => {
            if let Some(member) = state.members.get_mut(user_name) {
                member
                    .devices
                    .insert(device.device_id.clone(), device.clone());
            }
        }

        TeamAction::RemoveDevice {
            user_name,
            device_id,
            ..
        } => {
            if let Some(member) = state.members.get_mut(user_name) {
                if let Some(device) = member.devices.remove(device_id) {
                    state.removed_devices.insert(device_id.clone(), device);
                }
            }
        }

        TeamAction::PostInvitation { invitation } => {
            state
                .invitations
                .insert(invitation.id, invitation.clone());
        }

        TeamAction::RevokeInvitation { id } => {
            if let Some(invitation) = state.invitations.get_mut(id) {
                invitation.revoked = true;
            }
        }

        TeamAction::AdmitInvitedMember { id, member, .. } => {
            if let Some(invitation) = state.invitations.get_mut(id) {
                invitation.uses += 1;
            }
            state.members.insert(member.user_name.clone(), member.clone());
        }

        TeamAction::AdmitInvitedDevice {
            id,
            user_name,
            device,
            ..
        } => {
            if let Some(invitation) = state.invitations.get_mut(id) {
                invitation.uses += 1;
            }
            if let Some(member) = state.members.get_mut(user_name) {
                member
                    .devices
                    .insert(device.device_id.clone(), device.clone());
            }
        }

        TeamAction::ChangeKeys { keys, .. } => match keys.scope {
            KeyScope::Member => {
                if let Some(member) = state.members.get_mut(&keys.name) {
                    member.keys = keys.clone();
                }
            }
            KeyScope::Device => {
                for member in state.members.values_mut() {
                    if let Some(device) = member.devices.get_mut(&keys.name) {
                        device.keys = keys.clone();
                    }
                }
            }
            // Team and role generations surface through the lockboxes
            // appended above.
            _ => {}
        },

        TeamAction::AddServer { server, .. } => {
            state.servers.insert(server.host.clone(), server.clone());
        }

        TeamAction::RemoveServer { host, .. } => {
            state.servers.remove(host);
        }
    }

    state
}
