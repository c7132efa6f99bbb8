// SPDX-License-Identifier: MIT OR Apache-2.0

//! The reduced team state: a pure value recomputed from the linearized
//! graph. Two peers holding the same links always reduce to the same state,
//! bit for bit, which is why every collection here is ordered.
use std::collections::BTreeMap;

use huddle_core::{KeyScope, Lockbox, PublicDevice, PublicKeyset, Server};
use huddle_crypto::x25519::PublicKey;
use huddle_crypto::Hash;
use serde::{Deserialize, Serialize};

use crate::member::{Member, PostedInvitation, Role, ADMIN_ROLE};

/// Public founding information, fixed at the root link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootContext {
    pub team_name: String,
    pub user_name: String,
    pub keys: PublicKeyset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamState {
    pub team_name: String,
    pub root_context: RootContext,
    pub members: BTreeMap<String, Member>,
    pub roles: BTreeMap<String, Role>,
    pub lockboxes: Vec<Lockbox>,
    pub invitations: BTreeMap<Hash, PostedInvitation>,
    pub removed_members: BTreeMap<String, Member>,
    pub removed_devices: BTreeMap<String, PublicDevice>,
    pub servers: BTreeMap<String, Server>,
}

impl TeamState {
    pub fn member(&self, user_name: &str) -> Option<&Member> {
        self.members.get(user_name)
    }

    pub fn has(&self, user_name: &str) -> bool {
        self.members.contains_key(user_name)
    }

    pub fn member_is_admin(&self, user_name: &str) -> bool {
        self.member(user_name)
            .map(|member| member.is_admin())
            .unwrap_or(false)
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn roles(&self) -> impl Iterator<Item = &Role> {
        self.roles.values()
    }

    pub fn role(&self, role_name: &str) -> Option<&Role> {
        self.roles.get(role_name)
    }

    pub fn admins(&self) -> impl Iterator<Item = &Member> {
        self.members.values().filter(|member| member.is_admin())
    }

    pub fn invitation(&self, id: &Hash) -> Option<&PostedInvitation> {
        self.invitations.get(id)
    }

    /// Member and record of the device with the given id, if enrolled.
    pub fn device(&self, device_id: &str) -> Option<(&Member, &PublicDevice)> {
        self.members.values().find_map(|member| {
            member
                .device(device_id)
                .map(|device| (member, device))
        })
    }

    /// Members holding the given role.
    pub fn members_in_role<'a>(&'a self, role_name: &'a str) -> impl Iterator<Item = &'a Member> {
        self.members
            .values()
            .filter(move |member| member.roles.contains(role_name))
    }

    /// The generation a scope is currently at.
    ///
    /// Key generations only surface through lockbox contents and the
    /// keysets embedded in member, device and server records; the current
    /// generation is the highest one visible anywhere.
    pub fn current_generation(&self, scope: KeyScope, name: &str) -> u32 {
        let from_lockboxes = self
            .lockboxes
            .iter()
            .map(|lockbox| &lockbox.contents.address)
            .filter(|address| address.scope == scope && address.name == name)
            .map(|address| address.generation)
            .max();

        let from_records = match scope {
            KeyScope::Member => self.members.get(name).map(|member| member.keys.generation),
            KeyScope::Device => self
                .device(name)
                .map(|(_, device)| device.keys.generation),
            KeyScope::Server => self.servers.get(name).map(|server| server.keys.generation),
            _ => None,
        };

        from_lockboxes.into_iter().chain(from_records).max().unwrap_or(0)
    }

    /// Current public encryption key of a scope, taken from the newest
    /// lockbox distributing it, falling back to the embedded records.
    pub fn encryption_key(&self, scope: KeyScope, name: &str) -> Option<(u32, PublicKey)> {
        let from_lockboxes = self
            .lockboxes
            .iter()
            .filter(|lockbox| {
                lockbox.contents.address.scope == scope && lockbox.contents.address.name == name
            })
            .max_by_key(|lockbox| lockbox.contents.address.generation)
            .map(|lockbox| {
                (
                    lockbox.contents.address.generation,
                    lockbox.contents.public_key,
                )
            });

        let from_records = match scope {
            KeyScope::Member => self
                .members
                .get(name)
                .map(|member| (member.keys.generation, member.keys.encryption)),
            KeyScope::Device => self
                .device(name)
                .map(|(_, device)| (device.keys.generation, device.keys.encryption)),
            KeyScope::Server => self
                .servers
                .get(name)
                .map(|server| (server.keys.generation, server.keys.encryption)),
            _ => None,
        };

        match (from_lockboxes, from_records) {
            (Some(a), Some(b)) => Some(if a.0 >= b.0 { a } else { b }),
            (a, b) => a.or(b),
        }
    }

    /// Lockboxes whose contents is the current generation of `(scope, name)`.
    pub fn current_lockboxes<'a>(
        &'a self,
        scope: KeyScope,
        name: &'a str,
    ) -> impl Iterator<Item = &'a Lockbox> {
        let generation = self.current_generation(scope, name);
        self.lockboxes.iter().filter(move |lockbox| {
            lockbox.contents.address.scope == scope
                && lockbox.contents.address.name == name
                && lockbox.contents.address.generation == generation
        })
    }

    /// The team has at least one admin; enforced by every validator that
    /// touches membership.
    pub fn admin_role_is_populated(&self) -> bool {
        self.roles.contains_key(ADMIN_ROLE) && self.admins().next().is_some()
    }
}
