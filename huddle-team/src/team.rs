// SPDX-License-Identifier: MIT OR Apache-2.0

//! The host-facing team instance.
//!
//! A `Team` owns one local view of the graph and funnels every mutation
//! through the same serial path: append a link, re-reduce, refresh the
//! keyring, notify observers. Connections share the instance and drive it
//! through the same path, so state never forks locally.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use huddle_core::cbor::{decode_cbor, encode_cbor, DecodeError, EncodeError};
use huddle_core::graph::{Graph, GraphError, LinkAuthor};
use huddle_core::{
    now_ms, KeyScope, Keyring, KeyringError, Keyset, KeysetAddress, KeysetError, Lockbox,
    LockboxError, MemberContext, PublicDevice, Server,
};
use huddle_crypto::aead::{aead_decrypt, aead_encrypt, AeadError};
use huddle_crypto::ed25519::Signature;
use huddle_crypto::serde::{deserialize_hex, serialize_hex};
use huddle_crypto::{Hash, Rng, RngError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::action::TeamAction;
use crate::invitation::{
    self, InvitationError, InvitationParams, ProofOfInvitation, ProofPayload,
};
use crate::member::{InvitationType, Member, Role, ADMIN_ROLE};
use crate::reduce::{reduce, ReduceError};
use crate::resolver::MembershipResolver;
use crate::rotation::{holders, plan_rotation, recipient_public, RotationError};
use crate::state::TeamState;
use crate::validate::member_exclusions;

/// Events emitted to host observers.
#[derive(Debug, Clone, PartialEq)]
pub enum TeamEvent {
    /// The graph gained links and state was re-reduced.
    Updated { head: Hash },
}

type Observer = Box<dyn Fn(&TeamEvent) + Send + Sync>;

/// Options for member invitations.
#[derive(Debug, Clone, Default)]
pub struct InviteOptions {
    /// Human-shareable secret; generated when absent.
    pub seed: Option<String>,
    /// `0` means unlimited uses.
    pub max_uses: u32,
    /// Milliseconds since the Unix epoch; `0` means no expiry.
    pub expiration: u64,
    /// Roles granted on admission.
    pub roles: Vec<String>,
}

/// AEAD envelope addressed to a team or role scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub scope: KeyScope,
    pub name: String,
    pub generation: u32,
    #[serde(serialize_with = "serialize_hex", deserialize_with = "deserialize_hex")]
    pub ciphertext: Vec<u8>,
}

/// Detached signature bound to a member device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureEnvelope {
    #[serde(serialize_with = "serialize_hex", deserialize_with = "deserialize_hex")]
    pub payload: Vec<u8>,
    pub author: LinkAuthor,
    pub signature: Signature,
}

#[derive(Serialize)]
struct SaveRef<'a> {
    graph: &'a Graph<TeamAction>,
    keyring: &'a Keyring,
}

#[derive(Deserialize)]
struct SavedTeam {
    graph: Graph<TeamAction>,
    keyring: Keyring,
}

pub struct Team {
    graph: Graph<TeamAction>,
    state: TeamState,
    context: MemberContext,
    keyring: Keyring,
    rng: Rng,
    observers: Vec<Observer>,
}

impl fmt::Debug for Team {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Team")
            .field("team_name", &self.state.team_name)
            .field("head", &self.graph.head())
            .field("members", &self.state.members.len())
            .finish()
    }
}

impl Team {
    /// Found a new team; the local context becomes the first member and
    /// sole admin.
    pub fn create(team_name: &str, context: MemberContext, rng: Rng) -> Result<Self, TeamError> {
        Self::found(team_name, context, None, rng)
    }

    /// Found a new team deriving the team keys from a seed, so tests and
    /// backups can reproduce them.
    pub fn create_from_seed(
        team_name: &str,
        context: MemberContext,
        seed: &str,
        rng: Rng,
    ) -> Result<Self, TeamError> {
        Self::found(team_name, context, Some(seed), rng)
    }

    fn found(
        team_name: &str,
        context: MemberContext,
        seed: Option<&str>,
        rng: Rng,
    ) -> Result<Self, TeamError> {
        let team_keys = match seed {
            Some(seed) => Keyset::from_seed(KeyScope::Team, team_name, seed)?,
            None => Keyset::generate(KeyScope::Team, team_name, &rng)?,
        };
        let admin_keys = Keyset::generate(KeyScope::Role, ADMIN_ROLE, &rng)?;

        let founder_keys = context.user.keys.public();
        let member = Member {
            user_name: context.user.user_name.clone(),
            keys: founder_keys.clone(),
            roles: BTreeSet::from([ADMIN_ROLE.to_string()]),
            devices: BTreeMap::from([(context.device.device_id(), context.device.public())]),
        };
        let lockboxes = vec![
            Lockbox::seal(&team_keys, &founder_keys, &rng)?,
            Lockbox::seal(&admin_keys, &founder_keys, &rng)?,
        ];

        let author = LinkAuthor {
            user_name: context.user.user_name.clone(),
            device_id: context.device.device_id(),
            generation: context.device.keys.generation,
        };
        let graph = Graph::create(
            TeamAction::Root {
                team_name: team_name.to_string(),
                member,
                lockboxes,
            },
            author,
            now_ms(),
            &context.device.keys.signing,
        );

        Self::from_parts(graph, Keyring::new(), context, rng)
    }

    /// Instantiate from a graph and keyring received over a connection
    /// (invitation admission) or built elsewhere.
    pub fn join(
        graph: Graph<TeamAction>,
        keyring: Keyring,
        context: MemberContext,
        rng: Rng,
    ) -> Result<Self, TeamError> {
        Self::from_parts(graph, keyring, context, rng)
    }

    /// Restore a team from a saved blob.
    pub fn load(blob: &[u8], context: MemberContext, rng: Rng) -> Result<Self, TeamError> {
        let saved: SavedTeam = decode_cbor(blob)?;
        Self::from_parts(saved.graph, saved.keyring, context, rng)
    }

    fn from_parts(
        graph: Graph<TeamAction>,
        keyring: Keyring,
        context: MemberContext,
        rng: Rng,
    ) -> Result<Self, TeamError> {
        graph.validate()?;
        let state = reduce(&graph, &MembershipResolver)?;

        let mut keyring = keyring;
        keyring.insert(context.device.keys.clone());
        keyring.insert(context.user.keys.clone());
        keyring.collect(&state.lockboxes);

        Ok(Self {
            graph,
            state,
            context,
            keyring,
            rng,
            observers: Vec::new(),
        })
    }

    /// Serialize graph and keyring into an opaque storage blob.
    pub fn save(&self) -> Result<Vec<u8>, TeamError> {
        Ok(encode_cbor(&SaveRef {
            graph: &self.graph,
            keyring: &self.keyring,
        })?)
    }

    // --- Selectors -------------------------------------------------------

    pub fn team_name(&self) -> &str {
        &self.state.team_name
    }

    pub fn state(&self) -> &TeamState {
        &self.state
    }

    pub fn graph(&self) -> &Graph<TeamAction> {
        &self.graph
    }

    pub fn head(&self) -> Hash {
        self.graph.head()
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    pub fn user_name(&self) -> &str {
        &self.context.user.user_name
    }

    /// The local identity this team instance acts as.
    pub fn context(&self) -> &MemberContext {
        &self.context
    }

    pub fn device_id(&self) -> String {
        self.context.device.device_id()
    }

    pub fn members(&self) -> Vec<&Member> {
        self.state.members().collect()
    }

    pub fn member(&self, user_name: &str) -> Result<&Member, TeamError> {
        self.state
            .member(user_name)
            .ok_or_else(|| TeamError::MemberNotFound(user_name.to_string()))
    }

    pub fn has(&self, user_name: &str) -> bool {
        self.state.has(user_name)
    }

    pub fn member_is_admin(&self, user_name: &str) -> bool {
        self.state.member_is_admin(user_name)
    }

    pub fn roles(&self) -> Vec<&Role> {
        self.state.roles().collect()
    }

    pub fn team_keys(&self) -> Result<&Keyset, TeamError> {
        Ok(self.keyring.get(KeyScope::Team, &self.state.team_name)?)
    }

    pub fn admin_keys(&self) -> Result<&Keyset, TeamError> {
        Ok(self.keyring.get(KeyScope::Role, ADMIN_ROLE)?)
    }

    // --- Membership ------------------------------------------------------

    /// Add a member directly: the caller already knows their public keys.
    pub fn add(&mut self, user: Member, roles: Vec<String>) -> Result<Hash, TeamError> {
        let mut member = user;
        member.roles.extend(roles);

        let team_keys = self.team_keys()?.clone();
        let mut lockboxes = vec![Lockbox::seal(&team_keys, &member.keys, &self.rng)?];
        for role_name in &member.roles {
            let role_keys = self.keyring.get(KeyScope::Role, role_name)?.clone();
            lockboxes.push(Lockbox::seal(&role_keys, &member.keys, &self.rng)?);
        }

        self.post(TeamAction::AddMember { member, lockboxes })
    }

    /// Remove a member and rotate every scope they could read.
    pub fn remove(&mut self, user_name: &str) -> Result<Hash, TeamError> {
        let member = self.member(user_name)?.clone();
        let excluded = member_exclusions(&member);
        let plan = plan_rotation(
            &self.state,
            &self.keyring,
            &(KeyScope::Member, user_name.to_string()),
            &excluded,
            &self.rng,
        )?;

        self.post_with_keysets(
            TeamAction::RemoveMember {
                user_name: user_name.to_string(),
                lockboxes: plan.lockboxes,
            },
            plan.keysets,
        )
    }

    // --- Roles -----------------------------------------------------------

    pub fn add_role(&mut self, role: Role) -> Result<Hash, TeamError> {
        let role_keys = Keyset::generate(KeyScope::Role, &role.role_name, &self.rng)?;
        let lockboxes = self
            .state
            .admins()
            .map(|admin| Lockbox::seal(&role_keys, &admin.keys, &self.rng))
            .collect::<Result<Vec<_>, _>>()?;

        self.post_with_keysets(TeamAction::AddRole { role, lockboxes }, vec![role_keys])
    }

    pub fn remove_role(&mut self, role_name: &str) -> Result<Hash, TeamError> {
        self.post(TeamAction::RemoveRole {
            role_name: role_name.to_string(),
        })
    }

    pub fn add_member_role(&mut self, user_name: &str, role_name: &str) -> Result<Hash, TeamError> {
        let role_keys = self.keyring.get(KeyScope::Role, role_name)?.clone();
        let member_keys = self.member(user_name)?.keys.clone();
        let lockboxes = vec![Lockbox::seal(&role_keys, &member_keys, &self.rng)?];

        self.post(TeamAction::AddMemberRole {
            user_name: user_name.to_string(),
            role_name: role_name.to_string(),
            lockboxes,
        })
    }

    pub fn remove_member_role(
        &mut self,
        user_name: &str,
        role_name: &str,
    ) -> Result<Hash, TeamError> {
        let plan = plan_rotation(
            &self.state,
            &self.keyring,
            &(KeyScope::Role, role_name.to_string()),
            &[(KeyScope::Member, user_name.to_string())],
            &self.rng,
        )?;

        self.post_with_keysets(
            TeamAction::RemoveMemberRole {
                user_name: user_name.to_string(),
                role_name: role_name.to_string(),
                lockboxes: plan.lockboxes,
            },
            plan.keysets,
        )
    }

    // --- Devices ---------------------------------------------------------

    /// Enroll another device for the local member.
    pub fn add_device(&mut self, device: PublicDevice) -> Result<Hash, TeamError> {
        let user_name = self.user_name().to_string();
        let member_keys = self.keyring.get(KeyScope::Member, &user_name)?.clone();
        let lockboxes = vec![Lockbox::seal(&member_keys, &device.keys, &self.rng)?];

        self.post(TeamAction::AddDevice {
            user_name,
            device,
            lockboxes,
        })
    }

    /// Remove one of the local member's devices and rotate everything it
    /// could read.
    pub fn remove_device(&mut self, device_id: &str) -> Result<Hash, TeamError> {
        let user_name = self.user_name().to_string();
        let plan = plan_rotation(
            &self.state,
            &self.keyring,
            &(KeyScope::Device, device_id.to_string()),
            &[(KeyScope::Device, device_id.to_string())],
            &self.rng,
        )?;

        self.post_with_keysets(
            TeamAction::RemoveDevice {
                user_name,
                device_id: device_id.to_string(),
                lockboxes: plan.lockboxes,
            },
            plan.keysets,
        )
    }

    // --- Invitations -----------------------------------------------------

    /// Invite `user_name` to the team. Returns the shareable seed and the
    /// invitation id.
    pub fn invite_member(
        &mut self,
        user_name: &str,
        options: InviteOptions,
    ) -> Result<(String, Hash), TeamError> {
        let seed = match options.seed {
            Some(seed) => seed,
            None => random_seed(&self.rng)?,
        };
        let team_keys = self.team_keys()?.clone();
        let invitation = invitation::create(
            &team_keys,
            InvitationParams {
                invitation_type: InvitationType::Member,
                name: user_name.to_string(),
                seed: seed.clone(),
                roles: options.roles,
                expiration: options.expiration,
                max_uses: options.max_uses,
            },
            &self.rng,
        )?;
        let id = invitation.id;

        self.post(TeamAction::PostInvitation { invitation })?;
        Ok((seed, id))
    }

    /// Invite one of the local member's own devices.
    pub fn invite_device(
        &mut self,
        device_id: &str,
        seed: Option<String>,
    ) -> Result<(String, Hash), TeamError> {
        let seed = match seed {
            Some(seed) => seed,
            None => random_seed(&self.rng)?,
        };
        let team_keys = self.team_keys()?.clone();
        let invitation = invitation::create(
            &team_keys,
            InvitationParams {
                invitation_type: InvitationType::Device,
                name: device_id.to_string(),
                seed: seed.clone(),
                roles: Vec::new(),
                expiration: 0,
                max_uses: 1,
            },
            &self.rng,
        )?;
        let id = invitation.id;

        self.post(TeamAction::PostInvitation { invitation })?;
        Ok((seed, id))
    }

    pub fn revoke_invitation(&mut self, id: Hash) -> Result<Hash, TeamError> {
        self.post(TeamAction::RevokeInvitation { id })
    }

    /// Admit an invited member: fully validate the proof (including the
    /// sealed payload) and post the admission.
    pub fn admit(&mut self, proof: ProofOfInvitation) -> Result<Hash, TeamError> {
        let posted = self
            .state
            .invitation(&proof.id)
            .ok_or(InvitationError::NotFound(proof.id))?
            .clone();
        let team_keys = self.team_keys()?.clone();
        invitation::validate_proof(&proof, &posted, Some(&team_keys), now_ms())?;

        let ProofPayload::Member(claimed) = &proof.payload else {
            return Err(TeamError::ProofMismatch);
        };
        let payload = invitation::open_payload(&posted, &team_keys)?;

        let mut member = claimed.clone();
        member.roles.extend(payload.roles.iter().cloned());

        let mut lockboxes = vec![Lockbox::seal(&team_keys, &member.keys, &self.rng)?];
        for role_name in &member.roles {
            let role_keys = self.keyring.get(KeyScope::Role, role_name)?.clone();
            lockboxes.push(Lockbox::seal(&role_keys, &member.keys, &self.rng)?);
        }

        self.post(TeamAction::AdmitInvitedMember {
            id: proof.id,
            proof,
            member,
            lockboxes,
        })
    }

    /// Admit one of the local member's devices from an invitation proof.
    pub fn admit_device(&mut self, proof: ProofOfInvitation) -> Result<Hash, TeamError> {
        let posted = self
            .state
            .invitation(&proof.id)
            .ok_or(InvitationError::NotFound(proof.id))?
            .clone();
        let team_keys = self.team_keys()?.clone();
        invitation::validate_proof(&proof, &posted, Some(&team_keys), now_ms())?;

        let ProofPayload::Device(device) = proof.payload.clone() else {
            return Err(TeamError::ProofMismatch);
        };
        let user_name = device.user_id.clone();
        let member_keys = self.keyring.get(KeyScope::Member, &user_name)?.clone();
        let lockboxes = vec![Lockbox::seal(&member_keys, &device.keys, &self.rng)?];

        self.post(TeamAction::AdmitInvitedDevice {
            id: proof.id,
            proof,
            user_name,
            device,
            lockboxes,
        })
    }

    // --- Servers ---------------------------------------------------------

    pub fn add_server(&mut self, server: Server) -> Result<Hash, TeamError> {
        let team_keys = self.team_keys()?.clone();
        let lockboxes = vec![Lockbox::seal(&team_keys, &server.keys, &self.rng)?];
        self.post(TeamAction::AddServer { server, lockboxes })
    }

    pub fn remove_server(&mut self, host: &str) -> Result<Hash, TeamError> {
        let plan = plan_rotation(
            &self.state,
            &self.keyring,
            &(KeyScope::Server, host.to_string()),
            &[(KeyScope::Server, host.to_string())],
            &self.rng,
        )?;

        self.post_with_keysets(
            TeamAction::RemoveServer {
                host: host.to_string(),
                lockboxes: plan.lockboxes,
            },
            plan.keysets,
        )
    }

    // --- Keys ------------------------------------------------------------

    /// Rotate a scope the local member holds, re-sealing the new keys to
    /// every current holder.
    pub fn change_keys(&mut self, scope: KeyScope, name: &str) -> Result<Hash, TeamError> {
        let current = self.keyring.get(scope, name)?.clone();
        let next = current.rotate(&self.rng)?;

        let mut lockboxes = Vec::new();
        for holder in holders(&self.state, scope, name) {
            let recipient = recipient_public(&self.state, &holder)
                .ok_or(RotationError::UnknownRecipient(holder.0, holder.1.clone()))?;
            lockboxes.push(Lockbox::seal(&next, &recipient, &self.rng)?);
        }

        self.post_with_keysets(
            TeamAction::ChangeKeys {
                keys: next.public(),
                lockboxes,
            },
            vec![next],
        )
    }

    // --- Envelopes -------------------------------------------------------

    /// Encrypt a payload for the whole team, or for a role when given.
    pub fn encrypt(&self, payload: &[u8], role: Option<&str>) -> Result<Envelope, TeamError> {
        let keyset = match role {
            Some(role_name) => self.keyring.get(KeyScope::Role, role_name)?,
            None => self.team_keys()?,
        };
        Ok(Envelope {
            scope: keyset.scope,
            name: keyset.name.clone(),
            generation: keyset.generation,
            ciphertext: aead_encrypt(&keyset.aead_key(), payload, None, &self.rng)?,
        })
    }

    pub fn decrypt(&self, envelope: &Envelope) -> Result<Vec<u8>, TeamError> {
        let keyset = self.keyring.get_at(&KeysetAddress::new(
            envelope.scope,
            envelope.name.clone(),
            envelope.generation,
        ))?;
        aead_decrypt(&keyset.aead_key(), &envelope.ciphertext, None)
            .map_err(|_| TeamError::DecryptionFailed)
    }

    /// Sign a payload with the local device key.
    pub fn sign(&self, payload: &[u8]) -> SignatureEnvelope {
        SignatureEnvelope {
            signature: self.context.device.keys.signing.sign(payload),
            payload: payload.to_vec(),
            author: self.author(),
        }
    }

    /// Verify a signature envelope against the signer's enrolled device.
    pub fn verify(&self, envelope: &SignatureEnvelope) -> Result<(), TeamError> {
        let author = &envelope.author;
        let member = self.state.member(&author.user_name).ok_or_else(|| {
            TeamError::UnknownSigner {
                user_name: author.user_name.clone(),
                device_id: author.device_id.clone(),
            }
        })?;
        let device = member.device(&author.device_id).ok_or_else(|| {
            TeamError::UnknownSigner {
                user_name: author.user_name.clone(),
                device_id: author.device_id.clone(),
            }
        })?;
        device
            .keys
            .signing
            .verify(&envelope.payload, &envelope.signature)
            .map_err(|_| TeamError::InvalidSignature)
    }

    // --- Events & sync ---------------------------------------------------

    pub fn subscribe(&mut self, observer: impl Fn(&TeamEvent) + Send + Sync + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Merge a peer's view of the graph. Returns whether anything changed.
    pub fn merge_graph(&mut self, other: &Graph<TeamAction>) -> Result<bool, TeamError> {
        let before = self.graph.head();
        let mut graph = self.graph.clone();
        graph.merge(other)?;
        if graph.head() == before {
            return Ok(false);
        }

        let state = reduce(&graph, &MembershipResolver)?;
        debug!(head = %graph.head(), "merged remote graph");
        self.graph = graph;
        self.commit(state);
        Ok(true)
    }

    // --- Internal --------------------------------------------------------

    fn author(&self) -> LinkAuthor {
        LinkAuthor {
            user_name: self.context.user.user_name.clone(),
            device_id: self.context.device.device_id(),
            generation: self.context.device.keys.generation,
        }
    }

    fn post(&mut self, action: TeamAction) -> Result<Hash, TeamError> {
        self.post_with_keysets(action, Vec::new())
    }

    /// Append an action and re-reduce. The append is committed only when
    /// the new link validates against the reduced state; `keysets` are
    /// locally-generated secrets (rotations) remembered on success.
    fn post_with_keysets(
        &mut self,
        action: TeamAction,
        keysets: Vec<Keyset>,
    ) -> Result<Hash, TeamError> {
        let mut graph = self.graph.clone();
        let hash = graph.append(
            action,
            self.author(),
            now_ms(),
            &self.context.device.keys.signing,
        );
        let state = reduce(&graph, &MembershipResolver)?;

        self.graph = graph;
        for keyset in keysets {
            self.keyring.insert(keyset);
        }
        self.commit(state);
        Ok(hash)
    }

    fn commit(&mut self, state: TeamState) {
        self.state = state;
        self.keyring.collect(&self.state.lockboxes);
        let event = TeamEvent::Updated {
            head: self.graph.head(),
        };
        for observer in &self.observers {
            observer(&event);
        }
    }
}

/// A human-shareable random seed, `xxxx-xxxx-xxxx-xxxx`.
fn random_seed(rng: &Rng) -> Result<String, TeamError> {
    let bytes: [u8; 8] = rng.random_array()?;
    let encoded = hex::encode(bytes);
    let mut seed = String::with_capacity(encoded.len() + 3);
    for (index, chunk) in [0usize, 4, 8, 12].into_iter().enumerate() {
        if index > 0 {
            seed.push('-');
        }
        seed.push_str(&encoded[chunk..chunk + 4]);
    }
    Ok(seed)
}

#[derive(Debug, Error)]
pub enum TeamError {
    #[error(transparent)]
    Reduce(#[from] ReduceError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Keyring(#[from] KeyringError),

    #[error(transparent)]
    Keyset(#[from] KeysetError),

    #[error(transparent)]
    Lockbox(#[from] LockboxError),

    #[error(transparent)]
    Rotation(#[from] RotationError),

    #[error(transparent)]
    Invitation(#[from] InvitationError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Aead(#[from] AeadError),

    #[error("{0} is not a member of this team")]
    MemberNotFound(String),

    #[error("proof does not fit this admission")]
    ProofMismatch,

    #[error("envelope could not be decrypted with any reachable key")]
    DecryptionFailed,

    #[error("signature envelope does not verify")]
    InvalidSignature,

    #[error("signer {user_name}/{device_id} is not enrolled in this team")]
    UnknownSigner {
        user_name: String,
        device_id: String,
    },
}
