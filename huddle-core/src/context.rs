// SPDX-License-Identifier: MIT OR Apache-2.0

//! Identity entities: users, devices and servers, plus the local contexts a
//! connection starts from.
use huddle_crypto::domain_hash;
use serde::{Deserialize, Serialize};

use crate::keyset::{Keyset, PublicKeyset};

const DEVICE_ID_DOMAIN: &str = "device_id";

/// Stable identifier for a device, derived from its owner and name.
pub fn device_id(user_id: &str, device_name: &str) -> String {
    domain_hash(DEVICE_ID_DOMAIN, format!("{user_id}::{device_name}")).to_hex()
}

/// A user as known locally, including member keyset secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalUser {
    pub user_name: String,
    pub keys: Keyset,
}

/// A device as known locally, including device keyset secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub user_id: String,
    pub device_name: String,
    pub keys: Keyset,
}

impl Device {
    pub fn device_id(&self) -> String {
        device_id(&self.user_id, &self.device_name)
    }

    pub fn public(&self) -> PublicDevice {
        PublicDevice {
            device_id: self.device_id(),
            user_id: self.user_id.clone(),
            device_name: self.device_name.clone(),
            keys: self.keys.public(),
        }
    }
}

/// Public device record as posted on the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicDevice {
    pub device_id: String,
    pub user_id: String,
    pub device_name: String,
    pub keys: PublicKeyset,
}

/// A relay or sync server, identified by hostname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub host: String,
    pub keys: PublicKeyset,
}

/// Local identity of an existing team member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberContext {
    pub user: LocalUser,
    pub device: Device,
}

/// Local identity of a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerContext {
    pub host: String,
    pub keys: Keyset,
}

/// Local identity of a peer joining with an invitation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteeContext {
    pub user: LocalUser,
    pub device: Device,
    pub invitation_seed: String,
}

/// The identity a connection is started with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LocalContext {
    Member(MemberContext),
    Server(ServerContext),
    Invitee(InviteeContext),
}

#[cfg(test)]
mod tests {
    use super::device_id;

    #[test]
    fn device_ids_are_stable_and_distinct() {
        let id = device_id("alice", "laptop");
        assert_eq!(id, device_id("alice", "laptop"));
        assert_ne!(id, device_id("alice", "phone"));
        assert_ne!(id, device_id("bob", "laptop"));
        assert_eq!(id.len(), 64);
    }

    #[test]
    fn separator_prevents_ambiguity() {
        assert_ne!(device_id("ab", "c"), device_id("a", "bc"));
    }
}
