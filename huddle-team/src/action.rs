// SPDX-License-Identifier: MIT OR Apache-2.0

//! The actions carried by links on the team graph.
//!
//! Each variant pairs with a validator (policy) and a transform (effect) in
//! the reducer; the serde tag is the wire name of the action.
use huddle_core::{Lockbox, PublicDevice, PublicKeyset, Server};
use huddle_crypto::Hash;
use serde::{Deserialize, Serialize};

use crate::invitation::ProofOfInvitation;
use crate::member::{Member, PostedInvitation, Role};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TeamAction {
    /// Founds the team. Only valid as the first link.
    Root {
        team_name: String,
        member: Member,
        lockboxes: Vec<Lockbox>,
    },

    AddMember {
        member: Member,
        lockboxes: Vec<Lockbox>,
    },

    RemoveMember {
        user_name: String,
        lockboxes: Vec<Lockbox>,
    },

    AddRole {
        role: Role,
        lockboxes: Vec<Lockbox>,
    },

    RemoveRole {
        role_name: String,
    },

    AddMemberRole {
        user_name: String,
        role_name: String,
        lockboxes: Vec<Lockbox>,
    },

    RemoveMemberRole {
        user_name: String,
        role_name: String,
        lockboxes: Vec<Lockbox>,
    },

    AddDevice {
        user_name: String,
        device: PublicDevice,
        lockboxes: Vec<Lockbox>,
    },

    RemoveDevice {
        user_name: String,
        device_id: String,
        lockboxes: Vec<Lockbox>,
    },

    PostInvitation {
        invitation: PostedInvitation,
    },

    RevokeInvitation {
        id: Hash,
    },

    AdmitInvitedMember {
        id: Hash,
        proof: ProofOfInvitation,
        member: Member,
        lockboxes: Vec<Lockbox>,
    },

    AdmitInvitedDevice {
        id: Hash,
        proof: ProofOfInvitation,
        user_name: String,
        device: PublicDevice,
        lockboxes: Vec<Lockbox>,
    },

    ChangeKeys {
        keys: PublicKeyset,
        lockboxes: Vec<Lockbox>,
    },

    AddServer {
        server: Server,
        lockboxes: Vec<Lockbox>,
    },

    RemoveServer {
        host: String,
        lockboxes: Vec<Lockbox>,
    },
}

impl TeamAction {
    /// Lockboxes posted with this action, if any.
    pub fn lockboxes(&self) -> &[Lockbox] {
        match self {
            TeamAction::Root { lockboxes, .. }
            | TeamAction::AddMember { lockboxes, .. }
            | TeamAction::RemoveMember { lockboxes, .. }
            | TeamAction::AddRole { lockboxes, .. }
            | TeamAction::AddMemberRole { lockboxes, .. }
            | TeamAction::RemoveMemberRole { lockboxes, .. }
            | TeamAction::AddDevice { lockboxes, .. }
            | TeamAction::RemoveDevice { lockboxes, .. }
            | TeamAction::AdmitInvitedMember { lockboxes, .. }
            | TeamAction::AdmitInvitedDevice { lockboxes, .. }
            | TeamAction::ChangeKeys { lockboxes, .. }
            | TeamAction::AddServer { lockboxes, .. }
            | TeamAction::RemoveServer { lockboxes, .. } => lockboxes,
            TeamAction::RemoveRole { .. }
            | TeamAction::PostInvitation { .. }
            | TeamAction::RevokeInvitation { .. } => &[],
        }
    }

    /// Wire name of the action, matching the serde tag.
    pub fn name(&self) -> &'static str {
        match self {
            TeamAction::Root { .. } => "ROOT",
            TeamAction::AddMember { .. } => "ADD_MEMBER",
            TeamAction::RemoveMember { .. } => "REMOVE_MEMBER",
            TeamAction::AddRole { .. } => "ADD_ROLE",
            TeamAction::RemoveRole { .. } => "REMOVE_ROLE",
            TeamAction::AddMemberRole { .. } => "ADD_MEMBER_ROLE",
            TeamAction::RemoveMemberRole { .. } => "REMOVE_MEMBER_ROLE",
            TeamAction::AddDevice { .. } => "ADD_DEVICE",
            TeamAction::RemoveDevice { .. } => "REMOVE_DEVICE",
            TeamAction::PostInvitation { .. } => "POST_INVITATION",
            TeamAction::RevokeInvitation { .. } => "REVOKE_INVITATION",
            TeamAction::AdmitInvitedMember { .. } => "ADMIT_INVITED_MEMBER",
            TeamAction::AdmitInvitedDevice { .. } => "ADMIT_INVITED_DEVICE",
            TeamAction::ChangeKeys { .. } => "CHANGE_KEYS",
            TeamAction::AddServer { .. } => "ADD_SERVER",
            TeamAction::RemoveServer { .. } => "REMOVE_SERVER",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TeamAction;

    #[test]
    fn wire_tags_match_names() {
        let action = TeamAction::RemoveRole {
            role_name: "guest".to_string(),
        };
        let json = serde_json::to_string(&action).unwrap();
        assert!(json.contains("\"type\":\"REMOVE_ROLE\""));

        let action_again: TeamAction = serde_json::from_str(&json).unwrap();
        assert_eq!(action, action_again);
        assert_eq!(action.name(), "REMOVE_ROLE");
    }
}
