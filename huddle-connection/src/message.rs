// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire messages exchanged between two peers.
//!
//! Every message travels inside a [`NumberedConnectionMessage`] carrying a
//! per-sender monotone index, which lets the receiver restore ordering
//! inside a small window and reject anything beyond it.
use huddle_core::graph::Link;
use huddle_crypto::ed25519::Signature;
use huddle_crypto::serde::{deserialize_hex, serialize_hex};
use huddle_crypto::x25519::PublicKey;
use huddle_crypto::Hash;
use huddle_team::{ProofOfInvitation, TeamAction};
use serde::{Deserialize, Serialize};

/// Bytes sealed to a recipient public key by a single-use sender keypair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedPackage {
    pub sender: PublicKey,
    #[serde(serialize_with = "serialize_hex", deserialize_with = "deserialize_hex")]
    pub ciphertext: Vec<u8>,
}

/// A challenge the claimed device must sign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityChallenge {
    #[serde(serialize_with = "serialize_hex", deserialize_with = "deserialize_hex")]
    pub nonce: Vec<u8>,
    pub device_id: String,
    pub timestamp: u64,
}

/// What a peer claims to be.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdentityClaim {
    /// An enrolled device of an existing member.
    Member {
        user_name: String,
        device_id: String,
    },

    /// A newcomer presenting proof of an invitation.
    Invitation { proof: ProofOfInvitation },
}

/// One half-round of graph synchronization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncPayload {
    /// Everything the sender knows, as a set of link hashes.
    Summary { head: Hash, known: Vec<Hash> },

    /// Links the receiver was missing according to its last summary.
    Links {
        head: Hash,
        links: Vec<Link<TeamAction>>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionMessage {
    RequestIdentity,

    ClaimIdentity {
        claim: IdentityClaim,
    },

    ChallengeIdentity {
        challenge: IdentityChallenge,
    },

    ProveIdentity {
        challenge: IdentityChallenge,
        proof: Signature,
    },

    AcceptIdentity,

    RejectIdentity {
        message: String,
    },

    /// Sent to an admitted invitee: the serialized graph plus the team
    /// keyring sealed to the newcomer's encryption key.
    AcceptInvitation {
        #[serde(serialize_with = "serialize_hex", deserialize_with = "deserialize_hex")]
        graph: Vec<u8>,
        keyring: SealedPackage,
    },

    Sync {
        payload: SyncPayload,
    },

    LocalUpdate {
        head: Hash,
    },

    Seed {
        encrypted_seed: SealedPackage,
    },

    EncryptedMessage {
        #[serde(serialize_with = "serialize_hex", deserialize_with = "deserialize_hex")]
        ciphertext: Vec<u8>,
    },

    Disconnect {
        message: String,
    },

    Error {
        message: String,
    },

    LocalError {
        message: String,
    },
}

impl ConnectionMessage {
    /// Wire name, matching the serde tag.
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionMessage::RequestIdentity => "REQUEST_IDENTITY",
            ConnectionMessage::ClaimIdentity { .. } => "CLAIM_IDENTITY",
            ConnectionMessage::ChallengeIdentity { .. } => "CHALLENGE_IDENTITY",
            ConnectionMessage::ProveIdentity { .. } => "PROVE_IDENTITY",
            ConnectionMessage::AcceptIdentity => "ACCEPT_IDENTITY",
            ConnectionMessage::RejectIdentity { .. } => "REJECT_IDENTITY",
            ConnectionMessage::AcceptInvitation { .. } => "ACCEPT_INVITATION",
            ConnectionMessage::Sync { .. } => "SYNC",
            ConnectionMessage::LocalUpdate { .. } => "LOCAL_UPDATE",
            ConnectionMessage::Seed { .. } => "SEED",
            ConnectionMessage::EncryptedMessage { .. } => "ENCRYPTED_MESSAGE",
            ConnectionMessage::Disconnect { .. } => "DISCONNECT",
            ConnectionMessage::Error { .. } => "ERROR",
            ConnectionMessage::LocalError { .. } => "LOCAL_ERROR",
        }
    }
}

/// Envelope numbering messages per sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumberedConnectionMessage {
    pub index: u32,
    pub message: ConnectionMessage,
}

#[cfg(test)]
mod tests {
    use super::{ConnectionMessage, NumberedConnectionMessage};

    #[test]
    fn wire_tags() {
        let message = NumberedConnectionMessage {
            index: 3,
            message: ConnectionMessage::RequestIdentity,
        };
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"type\":\"REQUEST_IDENTITY\""));
        assert!(json.contains("\"index\":3"));

        let message_again: NumberedConnectionMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(message, message_again);
        assert_eq!(message.message.name(), "REQUEST_IDENTITY");
    }
}
