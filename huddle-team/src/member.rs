// SPDX-License-Identifier: MIT OR Apache-2.0

//! Records held in team state: members, roles, posted invitations and
//! servers.
use std::collections::{BTreeMap, BTreeSet};

use huddle_core::{PublicDevice, PublicKeyset};
use huddle_crypto::ed25519::VerifyingKey;
use huddle_crypto::serde::{deserialize_hex, serialize_hex};
use huddle_crypto::Hash;
use serde::{Deserialize, Serialize};

/// Name of the role every team carries from its first link on.
pub const ADMIN_ROLE: &str = "admin";

/// A team member: public keys, role assignments and enrolled devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub user_name: String,
    pub keys: PublicKeyset,
    pub roles: BTreeSet<String>,
    pub devices: BTreeMap<String, PublicDevice>,
}

impl Member {
    pub fn is_admin(&self) -> bool {
        self.roles.contains(ADMIN_ROLE)
    }

    pub fn device(&self, device_id: &str) -> Option<&PublicDevice> {
        self.devices.get(device_id)
    }
}

/// A named role with free-form permission strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub role_name: String,
    pub permissions: BTreeSet<String>,
}

impl Role {
    pub fn named(role_name: impl Into<String>) -> Self {
        Self {
            role_name: role_name.into(),
            permissions: BTreeSet::new(),
        }
    }

    pub fn admin() -> Self {
        Self {
            role_name: ADMIN_ROLE.to_string(),
            permissions: BTreeSet::from([ADMIN_ROLE.to_string()]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InvitationType {
    Member,
    Device,
}

/// An invitation as posted on the graph.
///
/// The payload is sealed under the team key; only the derived public signing
/// key, use accounting and revocation flag are in the clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostedInvitation {
    pub id: Hash,
    #[serde(serialize_with = "serialize_hex", deserialize_with = "deserialize_hex")]
    pub ciphertext: Vec<u8>,
    pub signing_key: VerifyingKey,
    pub invitation_type: InvitationType,
    /// `0` means unlimited uses.
    pub max_uses: u32,
    /// Milliseconds since the Unix epoch; `0` means no expiry.
    pub expiration: u64,
    pub revoked: bool,
    pub uses: u32,
}
