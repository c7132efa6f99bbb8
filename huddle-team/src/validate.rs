// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-action validators.
//!
//! Validation is pure policy: given the reduced state immediately preceding
//! a link, decide whether the link's action is permitted. Effects live in
//! the transforms next door in `reduce`.
use huddle_core::graph::SignedLink;
use huddle_core::{KeyScope, Lockbox};
use huddle_crypto::Hash;
use thiserror::Error;

use crate::action::TeamAction;
use crate::invitation::{validate_proof, InvitationError, ProofPayload};
use crate::member::{InvitationType, Member, PostedInvitation, Role, ADMIN_ROLE};
use crate::rotation::{holders, scopes_to_rotate, ScopeKey};
use crate::state::TeamState;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{user_name} is not an admin")]
    NotAdmin { user_name: String },

    #[error("{0} is not a member of this team")]
    MemberNotFound(String),

    #[error("{0} is already a member of this team")]
    AlreadyMember(String),

    #[error("role {0} does not exist")]
    RoleNotFound(String),

    #[error("role {0} already exists")]
    RoleAlreadyExists(String),

    #[error("{user_name} already holds role {role_name}")]
    RoleAlreadyAssigned {
        user_name: String,
        role_name: String,
    },

    #[error("{user_name} does not hold role {role_name}")]
    RoleNotAssigned {
        user_name: String,
        role_name: String,
    },

    #[error("the admin role cannot be removed")]
    AdminRoleProtected,

    #[error("this change would leave the team without admins")]
    LastAdmin,

    #[error("device {0} is already enrolled")]
    DeviceAlreadyEnrolled(String),

    #[error("device {0} is not enrolled")]
    DeviceNotFound(String),

    #[error("members must keep at least one device")]
    LastDevice,

    #[error("{0} cannot remove themselves")]
    SelfRemoval(String),

    #[error("server {0} is already part of this team")]
    ServerAlreadyAdded(String),

    #[error("server {0} is not part of this team")]
    ServerNotFound(String),

    #[error("a root link is only valid as the first link")]
    RootNotFirst,

    #[error("the first link must be a root link")]
    MissingRoot,

    #[error("the root link must be authored by the founding member's device")]
    RootAuthorMismatch,

    #[error("author {0} is not a member of this team")]
    AuthorNotMember(String),

    #[error("author device {device_id} is not enrolled for {user_name}")]
    AuthorDeviceNotFound {
        user_name: String,
        device_id: String,
    },

    #[error("invitation {0} is already posted")]
    DuplicateInvitation(Hash),

    #[error("invitation {id} is of the wrong kind for this admission")]
    WrongInvitationType { id: Hash },

    #[error("admitted principal does not match the invitation proof")]
    ProofMismatch,

    #[error(transparent)]
    Invitation(#[from] InvitationError),

    #[error("missing lockbox sealing {contents_scope}/{contents_name} to {recipient_scope}/{recipient_name}")]
    MissingLockbox {
        contents_scope: KeyScope,
        contents_name: String,
        recipient_scope: KeyScope,
        recipient_name: String,
    },

    #[error("removal must rotate {scope}/{name} for every remaining holder")]
    RotationIncomplete { scope: KeyScope, name: String },

    #[error("expected {scope} keys at generation {expected}, got {actual}")]
    GenerationMismatch {
        scope: KeyScope,
        expected: u32,
        actual: u32,
    },

    #[error("{user_name} may not change keys for this scope")]
    NotKeyHolder { user_name: String },

    #[error("only {user_name} may enroll or admit their own devices")]
    DeviceOwnershipRequired { user_name: String },
}

/// Validate one link against the state reduced immediately before it.
pub fn validate(state: &TeamState, link: &SignedLink<TeamAction>) -> Result<(), ValidationError> {
    let author = &link.body.author.user_name;
    let timestamp = link.body.timestamp;

    match &link.body.payload {
        TeamAction::Root { .. } => Err(ValidationError::RootNotFirst),

        TeamAction::AddMember { member, lockboxes } => {
            require_admin(state, author)?;
            validate_new_member(state, member)?;
            require_member_lockboxes(state, member, lockboxes)
        }

        TeamAction::RemoveMember {
            user_name,
            lockboxes,
        } => {
            require_admin(state, author)?;
            if author == user_name {
                return Err(ValidationError::SelfRemoval(user_name.clone()));
            }
            let member = require_member(state, user_name)?;
            if member.is_admin() && state.admins().count() == 1 {
                return Err(ValidationError::LastAdmin);
            }
            let excluded = member_exclusions(member);
            check_rotation(
                state,
                &(KeyScope::Member, user_name.clone()),
                &excluded,
                lockboxes,
            )
        }

        TeamAction::AddRole { role, lockboxes } => {
            require_admin(state, author)?;
            if state.role(&role.role_name).is_some() {
                return Err(ValidationError::RoleAlreadyExists(role.role_name.clone()));
            }
            // Admins manage every role, so each of them must be able to
            // open the new role keys.
            for admin in state.admins() {
                require_lockbox(
                    lockboxes,
                    (KeyScope::Role, &role.role_name),
                    (KeyScope::Member, &admin.user_name),
                )?;
            }
            Ok(())
        }

        TeamAction::RemoveRole { role_name } => {
            require_admin(state, author)?;
            if role_name == ADMIN_ROLE {
                return Err(ValidationError::AdminRoleProtected);
            }
            require_role(state, role_name)?;
            Ok(())
        }

        TeamAction::AddMemberRole {
            user_name,
            role_name,
            lockboxes,
        } => {
            require_admin(state, author)?;
            let member = require_member(state, user_name)?;
            require_role(state, role_name)?;
            if member.roles.contains(role_name) {
                return Err(ValidationError::RoleAlreadyAssigned {
                    user_name: user_name.clone(),
                    role_name: role_name.clone(),
                });
            }
            require_lockbox(
                lockboxes,
                (KeyScope::Role, role_name),
                (KeyScope::Member, user_name),
            )
        }

        TeamAction::RemoveMemberRole {
            user_name,
            role_name,
            lockboxes,
        } => {
            require_admin(state, author)?;
            let member = require_member(state, user_name)?;
            if !member.roles.contains(role_name) {
                return Err(ValidationError::RoleNotAssigned {
                    user_name: user_name.clone(),
                    role_name: role_name.clone(),
                });
            }
            if role_name == ADMIN_ROLE && state.admins().count() == 1 {
                return Err(ValidationError::LastAdmin);
            }
            check_rotation(
                state,
                &(KeyScope::Role, role_name.clone()),
                &[(KeyScope::Member, user_name.clone())],
                lockboxes,
            )
        }

        TeamAction::AddDevice {
            user_name,
            device,
            lockboxes,
        } => {
            require_device_authority(state, author, user_name)?;
            require_member(state, user_name)?;
            if state.device(&device.device_id).is_some() {
                return Err(ValidationError::DeviceAlreadyEnrolled(
                    device.device_id.clone(),
                ));
            }
            require_lockbox(
                lockboxes,
                (KeyScope::Member, user_name),
                (KeyScope::Device, &device.device_id),
            )
        }

        TeamAction::RemoveDevice {
            user_name,
            device_id,
            lockboxes,
        } => {
            require_device_authority(state, author, user_name)?;
            let member = require_member(state, user_name)?;
            if member.device(device_id).is_none() {
                return Err(ValidationError::DeviceNotFound(device_id.clone()));
            }
            if member.devices.len() == 1 {
                return Err(ValidationError::LastDevice);
            }
            check_rotation(
                state,
                &(KeyScope::Device, device_id.clone()),
                &[(KeyScope::Device, device_id.clone())],
                lockboxes,
            )
        }

        TeamAction::PostInvitation { invitation } => {
            if state.invitation(&invitation.id).is_some() {
                return Err(ValidationError::DuplicateInvitation(invitation.id));
            }
            // Member invitations are an admin power; members may invite
            // devices for themselves.
            if invitation.invitation_type == InvitationType::Member {
                require_admin(state, author)?;
            }
            Ok(())
        }

        TeamAction::RevokeInvitation { id } => {
            require_admin(state, author)?;
            state
                .invitation(id)
                .ok_or(InvitationError::NotFound(*id))?;
            Ok(())
        }

        TeamAction::AdmitInvitedMember {
            id,
            proof,
            member,
            lockboxes,
        } => {
            let posted = require_invitation(state, id, InvitationType::Member)?;
            validate_proof(proof, posted, None, timestamp)?;
            match &proof.payload {
                ProofPayload::Member(claimed)
                    if claimed.user_name == member.user_name && claimed.keys == member.keys => {}
                _ => return Err(ValidationError::ProofMismatch),
            }
            validate_new_member(state, member)?;
            require_member_lockboxes(state, member, lockboxes)
        }

        TeamAction::AdmitInvitedDevice {
            id,
            proof,
            user_name,
            device,
            lockboxes,
        } => {
            require_device_authority(state, author, user_name)?;
            let posted = require_invitation(state, id, InvitationType::Device)?;
            validate_proof(proof, posted, None, timestamp)?;
            match &proof.payload {
                ProofPayload::Device(claimed) if claimed.device_id == device.device_id => {}
                _ => return Err(ValidationError::ProofMismatch),
            }
            require_member(state, user_name)?;
            if state.device(&device.device_id).is_some() {
                return Err(ValidationError::DeviceAlreadyEnrolled(
                    device.device_id.clone(),
                ));
            }
            require_lockbox(
                lockboxes,
                (KeyScope::Member, user_name),
                (KeyScope::Device, &device.device_id),
            )
        }

        TeamAction::ChangeKeys { keys, lockboxes } => {
            let expected = state.current_generation(keys.scope, &keys.name) + 1;
            if keys.generation != expected {
                return Err(ValidationError::GenerationMismatch {
                    scope: keys.scope,
                    expected,
                    actual: keys.generation,
                });
            }

            // Possession of the scope's secret cannot be observed from the
            // link; authorship is the proxy. Members rotate their own
            // member and device scopes, any member may rotate the team
            // scope, role scopes take a role holder or an admin.
            let authorized = match keys.scope {
                KeyScope::Member => *author == keys.name,
                KeyScope::Device => link.body.author.device_id == keys.name,
                KeyScope::Team => state.has(author),
                KeyScope::Role => {
                    state.member_is_admin(author)
                        || state
                            .member(author)
                            .map(|member| member.roles.contains(&keys.name))
                            .unwrap_or(false)
                }
                KeyScope::Server | KeyScope::Ephemeral => false,
            };
            if !authorized {
                return Err(ValidationError::NotKeyHolder {
                    user_name: author.clone(),
                });
            }

            // Every current holder keeps access at the new generation.
            for holder in holders(state, keys.scope, &keys.name) {
                require_lockbox(
                    lockboxes,
                    (keys.scope, &keys.name),
                    (holder.0, &holder.1),
                )?;
            }
            Ok(())
        }

        TeamAction::AddServer { server, lockboxes } => {
            require_admin(state, author)?;
            if state.servers.contains_key(&server.host) {
                return Err(ValidationError::ServerAlreadyAdded(server.host.clone()));
            }
            require_lockbox(
                lockboxes,
                (KeyScope::Team, &state.team_name),
                (KeyScope::Server, &server.host),
            )
        }

        TeamAction::RemoveServer { host, lockboxes } => {
            require_admin(state, author)?;
            if !state.servers.contains_key(host) {
                return Err(ValidationError::ServerNotFound(host.clone()));
            }
            check_rotation(
                state,
                &(KeyScope::Server, host.clone()),
                &[(KeyScope::Server, host.clone())],
                lockboxes,
            )
        }
    }
}

/// Validate the founding link, which runs against no prior state.
pub fn validate_root(link: &SignedLink<TeamAction>) -> Result<(), ValidationError> {
    let TeamAction::Root {
        team_name,
        member,
        lockboxes,
    } = &link.body.payload
    else {
        return Err(ValidationError::MissingRoot);
    };

    let author = &link.body.author;
    if author.user_name != member.user_name || member.device(&author.device_id).is_none() {
        return Err(ValidationError::RootAuthorMismatch);
    }
    if !member.roles.contains(ADMIN_ROLE) {
        return Err(ValidationError::NotAdmin {
            user_name: member.user_name.clone(),
        });
    }

    // The founder must be able to open the team and admin keys.
    require_lockbox(
        lockboxes,
        (KeyScope::Team, team_name),
        (KeyScope::Member, &member.user_name),
    )?;
    require_lockbox(
        lockboxes,
        (KeyScope::Role, ADMIN_ROLE),
        (KeyScope::Member, &member.user_name),
    )?;

    Ok(())
}

fn require_admin<'a>(
    state: &'a TeamState,
    user_name: &str,
) -> Result<&'a Member, ValidationError> {
    let member = require_member(state, user_name)
        .map_err(|_| ValidationError::NotAdmin {
            user_name: user_name.to_string(),
        })?;
    if !member.is_admin() {
        return Err(ValidationError::NotAdmin {
            user_name: user_name.to_string(),
        });
    }
    Ok(member)
}

fn require_member<'a>(
    state: &'a TeamState,
    user_name: &str,
) -> Result<&'a Member, ValidationError> {
    state
        .member(user_name)
        .ok_or_else(|| ValidationError::MemberNotFound(user_name.to_string()))
}

fn require_role<'a>(state: &'a TeamState, role_name: &str) -> Result<&'a Role, ValidationError> {
    state
        .role(role_name)
        .ok_or_else(|| ValidationError::RoleNotFound(role_name.to_string()))
}

fn require_invitation<'a>(
    state: &'a TeamState,
    id: &Hash,
    expected: InvitationType,
) -> Result<&'a PostedInvitation, ValidationError> {
    let posted = state
        .invitation(id)
        .ok_or(InvitationError::NotFound(*id))?;
    if posted.invitation_type != expected {
        return Err(ValidationError::WrongInvitationType { id: *id });
    }
    Ok(posted)
}

/// Members manage their own devices; admins may act for them.
fn require_device_authority(
    state: &TeamState,
    author: &str,
    user_name: &str,
) -> Result<(), ValidationError> {
    if author == user_name || state.member_is_admin(author) {
        Ok(())
    } else {
        Err(ValidationError::DeviceOwnershipRequired {
            user_name: user_name.to_string(),
        })
    }
}

fn require_lockbox(
    lockboxes: &[Lockbox],
    contents: (KeyScope, &str),
    recipient: (KeyScope, &str),
) -> Result<(), ValidationError> {
    let found = lockboxes.iter().any(|lockbox| {
        lockbox.contents.address.scope == contents.0
            && lockbox.contents.address.name == contents.1
            && lockbox.recipient.address.scope == recipient.0
            && lockbox.recipient.address.name == recipient.1
    });
    if found {
        Ok(())
    } else {
        Err(ValidationError::MissingLockbox {
            contents_scope: contents.0,
            contents_name: contents.1.to_string(),
            recipient_scope: recipient.0,
            recipient_name: recipient.1.to_string(),
        })
    }
}

/// A new member may not collide with existing names or devices, and all
/// their roles must exist.
fn validate_new_member(state: &TeamState, member: &Member) -> Result<(), ValidationError> {
    if state.has(&member.user_name) {
        return Err(ValidationError::AlreadyMember(member.user_name.clone()));
    }
    for role_name in &member.roles {
        require_role(state, role_name)?;
    }
    for device_id in member.devices.keys() {
        if state.device(device_id).is_some() {
            return Err(ValidationError::DeviceAlreadyEnrolled(device_id.clone()));
        }
    }
    Ok(())
}

/// Team keys and each assigned role's keys must be sealed to the new
/// member.
fn require_member_lockboxes(
    state: &TeamState,
    member: &Member,
    lockboxes: &[Lockbox],
) -> Result<(), ValidationError> {
    require_lockbox(
        lockboxes,
        (KeyScope::Team, &state.team_name),
        (KeyScope::Member, &member.user_name),
    )?;
    for role_name in &member.roles {
        require_lockbox(
            lockboxes,
            (KeyScope::Role, role_name),
            (KeyScope::Member, &member.user_name),
        )?;
    }
    Ok(())
}

/// The removed member and all their devices stop receiving lockboxes.
pub(crate) fn member_exclusions(member: &Member) -> Vec<ScopeKey> {
    let mut excluded = vec![(KeyScope::Member, member.user_name.clone())];
    excluded.extend(
        member
            .devices
            .keys()
            .map(|device_id| (KeyScope::Device, device_id.clone())),
    );
    excluded
}

/// Every scope compromised by the removal must be rotated to the next
/// generation for each of its remaining holders.
fn check_rotation(
    state: &TeamState,
    seed: &ScopeKey,
    excluded: &[ScopeKey],
    lockboxes: &[Lockbox],
) -> Result<(), ValidationError> {
    for (scope, name) in scopes_to_rotate(state, seed) {
        let expected_generation = state.current_generation(scope, &name) + 1;
        for holder in holders(state, scope, &name) {
            if excluded.contains(&holder) {
                continue;
            }
            let covered = lockboxes.iter().any(|lockbox| {
                lockbox.contents.address.scope == scope
                    && lockbox.contents.address.name == name
                    && lockbox.contents.address.generation == expected_generation
                    && lockbox.recipient.address.scope == holder.0
                    && lockbox.recipient.address.name == holder.1
            });
            if !covered {
                return Err(ValidationError::RotationIncomplete { scope, name });
            }
        }
    }
    Ok(())
}
