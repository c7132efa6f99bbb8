// SPDX-License-Identifier: MIT OR Apache-2.0

//! The pairwise connection state machine.
//!
//! The machine is sans-IO: the host feeds numbered messages in through
//! [`Connection::deliver`] and drains outgoing messages and events from the
//! queues. Any full-duplex ordered byte channel can drive it.
//!
//! Both peers run the same protocol: request and claim identities, verify
//! the peer's claim with a signed challenge (or admit them from an
//! invitation proof), synchronize graphs until the heads match, then seal
//! random seed contributions to each other and derive the session key.
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

use huddle_core::cbor::{decode_cbor, encode_cbor, DecodeError, EncodeError};
use huddle_core::graph::{Graph, GraphError};
use huddle_core::{InviteeContext, KeyScope, Keyring, KeyringError, MemberContext};
use huddle_crypto::aead::{aead_decrypt, aead_encrypt, AeadError};
use huddle_crypto::ed25519::SigningKey;
use huddle_crypto::seal::{seal, unseal, SealError};
use huddle_crypto::x25519::SecretKey;
use huddle_crypto::{domain_hash, Hash, Rng, RngError, Secret};
use huddle_team::invitation::{accept, ProofPayload};
use huddle_team::{InvitationError, InvitationType, Member, Team, TeamAction, TeamError};
use thiserror::Error;
use tracing::{debug, warn};

use crate::message::{
    ConnectionMessage, IdentityChallenge, IdentityClaim, NumberedConnectionMessage, SealedPackage,
    SyncPayload,
};
use crate::sync::{assemble_remote, known_hashes, missing_links};

/// Per-substate timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// How far ahead of the expected index a message may arrive and still be
/// buffered instead of rejected.
const REORDER_WINDOW: u32 = 8;

const SESSION_DOMAIN: &str = "session";

#[derive(Debug, Clone, PartialEq)]
pub enum DisconnectReason {
    /// `stop()` was called locally.
    Stopped,
    /// The peer sent DISCONNECT.
    Peer(String),
    /// A substate outlived its timeout.
    Timeout,
    /// A protocol or validation failure.
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Authenticating,
    Synchronizing,
    Negotiating,
    Connected,
    Disconnected(DisconnectReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Mutual authentication, sync and seed negotiation all completed.
    Connected,
    /// The shared team gained links through this connection.
    Updated { head: Hash },
    /// A decrypted application payload.
    Message(Vec<u8>),
    /// Terminal.
    Disconnected(DisconnectReason),
    /// A local failure the host may want to surface.
    LocalError(String),
}

pub struct Connection {
    team: Option<Arc<Mutex<Team>>>,
    invitee: Option<(InviteeContext, InvitationType)>,

    state: ConnectionState,
    state_entered_at: u64,
    timeout_ms: u64,

    outbox: VecDeque<NumberedConnectionMessage>,
    events: VecDeque<ConnectionEvent>,
    next_index: u32,
    expected_index: u32,
    buffered: BTreeMap<u32, ConnectionMessage>,

    claim_sent: bool,
    pending_claim: Option<IdentityClaim>,
    peer: Option<(String, String)>,
    sent_challenge: Option<IdentityChallenge>,
    we_accepted_peer: bool,
    peer_accepted_us: bool,

    their_head: Option<Hash>,
    last_summary_head: Option<Hash>,

    our_seed: Option<Secret<32>>,
    seed_sent: bool,
    peer_seed: Option<Secret<32>>,
    session_key: Option<Secret<32>>,

    rng: Rng,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("peer", &self.peer)
            .finish()
    }
}

impl Connection {
    /// Connect as an existing member, sharing the given team instance.
    pub fn connect(team: Arc<Mutex<Team>>, rng: Rng) -> Self {
        Self::new(Some(team), None, rng)
    }

    /// Connect as a newcomer holding an invitation seed.
    pub fn connect_invitee(context: InviteeContext, kind: InvitationType, rng: Rng) -> Self {
        Self::new(None, Some((context, kind)), rng)
    }

    fn new(
        team: Option<Arc<Mutex<Team>>>,
        invitee: Option<(InviteeContext, InvitationType)>,
        rng: Rng,
    ) -> Self {
        Self {
            team,
            invitee,
            state: ConnectionState::Idle,
            state_entered_at: 0,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            outbox: VecDeque::new(),
            events: VecDeque::new(),
            next_index: 0,
            expected_index: 0,
            buffered: BTreeMap::new(),
            claim_sent: false,
            pending_claim: None,
            peer: None,
            sent_challenge: None,
            we_accepted_peer: false,
            peer_accepted_us: false,
            their_head: None,
            last_summary_head: None,
            our_seed: None,
            seed_sent: false,
            peer_seed: None,
            session_key: None,
            rng,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// The team this connection operates on; present for invitees only
    /// after admission.
    pub fn team(&self) -> Option<Arc<Mutex<Team>>> {
        self.team.clone()
    }

    pub fn session_key(&self) -> Option<&Secret<32>> {
        self.session_key.as_ref()
    }

    /// Drain outgoing messages for the transport.
    pub fn outgoing(&mut self) -> Vec<NumberedConnectionMessage> {
        self.outbox.drain(..).collect()
    }

    /// Drain events for the host.
    pub fn events(&mut self) -> Vec<ConnectionEvent> {
        self.events.drain(..).collect()
    }

    /// Begin the protocol. Idempotent.
    pub fn start(&mut self, now: u64) {
        if self.state != ConnectionState::Idle {
            return;
        }
        self.transition(ConnectionState::Connecting, now);
        self.send(ConnectionMessage::RequestIdentity);
    }

    /// Stop the connection. Synchronous and idempotent; a stopped
    /// connection refuses further deliveries.
    pub fn stop(&mut self) {
        if matches!(self.state, ConnectionState::Disconnected(_)) {
            return;
        }
        self.send(ConnectionMessage::Disconnect {
            message: "connection stopped".to_string(),
        });
        self.finish(DisconnectReason::Stopped);
    }

    /// Announce a new local head to the peer, triggering a sync round.
    pub fn local_update(&mut self) -> Result<(), ConnectionError> {
        if !matches!(
            self.state,
            ConnectionState::Synchronizing
                | ConnectionState::Negotiating
                | ConnectionState::Connected
        ) {
            return Ok(());
        }
        let head = self.with_team(|team| team.head())?;
        self.last_summary_head = None;
        self.send(ConnectionMessage::LocalUpdate { head });
        Ok(())
    }

    /// Encrypt an application payload under the session key and queue it.
    pub fn send_message(&mut self, payload: &[u8]) -> Result<(), ConnectionError> {
        let key = self
            .session_key
            .as_ref()
            .ok_or(ConnectionError::NotConnected)?;
        let ciphertext = aead_encrypt(key.as_bytes(), payload, None, &self.rng)?;
        self.send(ConnectionMessage::EncryptedMessage { ciphertext });
        Ok(())
    }

    /// Transition to disconnected if the current substate outlived its
    /// timeout. Returns whether the connection timed out.
    pub fn check_timeout(&mut self, now: u64) -> bool {
        if matches!(
            self.state,
            ConnectionState::Idle | ConnectionState::Connected | ConnectionState::Disconnected(_)
        ) {
            return false;
        }
        if now.saturating_sub(self.state_entered_at) <= self.timeout_ms {
            return false;
        }
        warn!(state = ?self.state, "connection timed out");
        self.events.push_back(ConnectionEvent::LocalError(format!(
            "timed out in {:?}",
            self.state
        )));
        self.send(ConnectionMessage::Disconnect {
            message: "timed out".to_string(),
        });
        self.finish(DisconnectReason::Timeout);
        true
    }

    /// Deliver one numbered message from the peer.
    pub fn deliver(
        &mut self,
        envelope: NumberedConnectionMessage,
        now: u64,
    ) -> Result<(), ConnectionError> {
        if matches!(self.state, ConnectionState::Disconnected(_)) {
            return Err(ConnectionError::Closed);
        }
        if self.state == ConnectionState::Idle {
            return Err(ConnectionError::NotStarted);
        }

        if envelope.index < self.expected_index {
            debug!(index = envelope.index, "dropping stale duplicate");
            return Ok(());
        }
        if envelope.index > self.expected_index {
            if envelope.index - self.expected_index <= REORDER_WINDOW {
                self.buffered.insert(envelope.index, envelope.message);
                return Ok(());
            }
            let message = format!(
                "message index {} outside reorder window, expected {}",
                envelope.index, self.expected_index
            );
            self.fail(&message);
            return Err(ConnectionError::ProtocolViolation(message));
        }

        self.expected_index += 1;
        let mut result = self.process(envelope.message, now);
        while result.is_ok() && !matches!(self.state, ConnectionState::Disconnected(_)) {
            let Some(buffered) = self.buffered.remove(&self.expected_index) else {
                break;
            };
            self.expected_index += 1;
            result = self.process(buffered, now);
        }

        if let Err(err) = &result {
            self.fail(&err.to_string());
        }
        result
    }

    // --- Message handling ------------------------------------------------

    fn process(&mut self, message: ConnectionMessage, now: u64) -> Result<(), ConnectionError> {
        debug!(message = message.name(), state = ?self.state, "processing");
        match message {
            ConnectionMessage::RequestIdentity => self.send_claim(now),

            ConnectionMessage::ClaimIdentity { claim } => match claim {
                IdentityClaim::Member {
                    user_name,
                    device_id,
                } => {
                    if self.team.is_none() {
                        // An invitee cannot verify members until it holds
                        // the team; revisit after admission.
                        self.pending_claim = Some(IdentityClaim::Member {
                            user_name,
                            device_id,
                        });
                        return Ok(());
                    }
                    self.handle_member_claim(user_name, device_id, now)
                }
                IdentityClaim::Invitation { proof } => self.handle_invitation_claim(proof, now),
            },

            ConnectionMessage::ChallengeIdentity { challenge } => self.handle_challenge(challenge),

            ConnectionMessage::ProveIdentity { challenge, proof } => {
                self.handle_proof(challenge, proof, now)
            }

            ConnectionMessage::AcceptIdentity => {
                self.peer_accepted_us = true;
                self.maybe_enter_sync(now)
            }

            ConnectionMessage::RejectIdentity { message } => {
                self.events
                    .push_back(ConnectionEvent::LocalError(message.clone()));
                self.finish(DisconnectReason::Error(message));
                Ok(())
            }

            ConnectionMessage::AcceptInvitation { graph, keyring } => {
                self.handle_accept_invitation(&graph, keyring, now)
            }

            ConnectionMessage::Sync { payload } => self.handle_sync(payload, now),

            ConnectionMessage::LocalUpdate { head } => {
                self.their_head = Some(head);
                let our_head = self.with_team(|team| team.head())?;
                if head != our_head {
                    self.last_summary_head = None;
                    self.send_summary()?;
                }
                Ok(())
            }

            ConnectionMessage::Seed { encrypted_seed } => self.handle_seed(encrypted_seed, now),

            ConnectionMessage::EncryptedMessage { ciphertext } => {
                let key = self
                    .session_key
                    .as_ref()
                    .ok_or(ConnectionError::NotConnected)?;
                let plaintext = aead_decrypt(key.as_bytes(), &ciphertext, None)
                    .map_err(|_| ConnectionError::DecryptionFailed)?;
                self.events.push_back(ConnectionEvent::Message(plaintext));
                Ok(())
            }

            ConnectionMessage::Disconnect { message } => {
                self.finish(DisconnectReason::Peer(message));
                Ok(())
            }

            ConnectionMessage::Error { message } | ConnectionMessage::LocalError { message } => {
                warn!(error = %message, "peer reported an error");
                self.events.push_back(ConnectionEvent::LocalError(message));
                Ok(())
            }
        }
    }

    fn send_claim(&mut self, now: u64) -> Result<(), ConnectionError> {
        if self.claim_sent {
            return Ok(());
        }
        self.claim_sent = true;

        if self.team.is_some() {
            let (user_name, device_id) = self.local_identity()?;
            self.send(ConnectionMessage::ClaimIdentity {
                claim: IdentityClaim::Member {
                    user_name,
                    device_id,
                },
            });
            self.transition(ConnectionState::Authenticating, now);
            return Ok(());
        }

        let (context, kind) = self
            .invitee
            .as_ref()
            .ok_or(ConnectionError::NoTeam)?
            .clone();
        let payload = match kind {
            InvitationType::Member => ProofPayload::Member(Member {
                user_name: context.user.user_name.clone(),
                keys: context.user.keys.public(),
                roles: BTreeSet::new(),
                devices: BTreeMap::from([(
                    context.device.device_id(),
                    context.device.public(),
                )]),
            }),
            InvitationType::Device => ProofPayload::Device(context.device.public()),
        };
        let proof = accept(&context.invitation_seed, payload)?;
        self.send(ConnectionMessage::ClaimIdentity {
            claim: IdentityClaim::Invitation { proof },
        });
        self.transition(ConnectionState::Authenticating, now);
        Ok(())
    }

    fn handle_member_claim(
        &mut self,
        user_name: String,
        device_id: String,
        now: u64,
    ) -> Result<(), ConnectionError> {
        let enrolled = self.with_team(|team| {
            team.state()
                .device(&device_id)
                .map(|(member, _)| member.user_name.clone())
        })?;

        match enrolled {
            Some(owner) if owner == user_name => {
                let challenge = IdentityChallenge {
                    nonce: self.rng.random_vec(32)?,
                    device_id: device_id.clone(),
                    timestamp: now,
                };
                self.sent_challenge = Some(challenge.clone());
                self.peer = Some((user_name, device_id));
                self.send(ConnectionMessage::ChallengeIdentity { challenge });
                self.transition(ConnectionState::Authenticating, now);
                Ok(())
            }
            _ => {
                self.reject(format!("device {device_id} is not enrolled for {user_name}"));
                Ok(())
            }
        }
    }

    fn handle_invitation_claim(
        &mut self,
        proof: huddle_team::ProofOfInvitation,
        now: u64,
    ) -> Result<(), ConnectionError> {
        if self.team.is_none() {
            return Err(ConnectionError::ProtocolViolation(
                "received an invitation claim without a team to admit into".to_string(),
            ));
        }

        let (peer_user, peer_device, recipient) = match &proof.payload {
            ProofPayload::Member(member) => (
                member.user_name.clone(),
                member.devices.keys().next().cloned().unwrap_or_default(),
                member.keys.encryption,
            ),
            ProofPayload::Device(device) => (
                device.user_id.clone(),
                device.device_id.clone(),
                device.keys.encryption,
            ),
        };

        let admission = self.with_team_mut(|team| match &proof.payload {
            ProofPayload::Member(_) => team.admit(proof.clone()),
            ProofPayload::Device(_) => team.admit_device(proof.clone()),
        })?;
        if let Err(err) = admission {
            self.reject(format!("invitation was not accepted: {err}"));
            return Ok(());
        }

        // Hand the newcomer the graph plus the keysets they are entitled
        // to, sealed to their encryption key.
        let (graph_bytes, package) = self.with_team(|team| -> Result<_, ConnectionError> {
            let graph_bytes = encode_cbor(team.graph())?;
            let mut package = Keyring::new();
            package.insert(team.team_keys()?.clone());
            if let Ok(member) = team.member(&peer_user) {
                for role_name in member.roles.clone() {
                    if let Ok(role_keys) = team.keyring().get(KeyScope::Role, &role_name) {
                        package.insert(role_keys.clone());
                    }
                }
            }
            Ok((graph_bytes, package))
        })??;

        let ephemeral = SecretKey::from_bytes(self.rng.random_array()?);
        let ciphertext = seal(&encode_cbor(&package)?, &recipient, &ephemeral, &self.rng)?;
        self.send(ConnectionMessage::AcceptInvitation {
            graph: graph_bytes,
            keyring: SealedPackage {
                sender: ephemeral.public_key(),
                ciphertext,
            },
        });

        self.peer = Some((peer_user, peer_device));
        self.transition(ConnectionState::Authenticating, now);
        Ok(())
    }

    fn handle_accept_invitation(
        &mut self,
        graph_bytes: &[u8],
        keyring: SealedPackage,
        now: u64,
    ) -> Result<(), ConnectionError> {
        let (context, kind) = self
            .invitee
            .as_ref()
            .ok_or_else(|| {
                ConnectionError::ProtocolViolation(
                    "unsolicited invitation acceptance".to_string(),
                )
            })?
            .clone();

        let graph: Graph<TeamAction> = decode_cbor(graph_bytes)?;
        let secret = match kind {
            InvitationType::Member => context.user.keys.encryption.clone(),
            InvitationType::Device => context.device.keys.encryption.clone(),
        };
        let package_bytes = unseal(&keyring.ciphertext, &keyring.sender, &secret)
            .map_err(|_| ConnectionError::DecryptionFailed)?;
        let package: Keyring = decode_cbor(&package_bytes)?;

        let team = Team::join(
            graph,
            package,
            MemberContext {
                user: context.user.clone(),
                device: context.device.clone(),
            },
            Rng::default(),
        )?;
        debug!(team = team.team_name(), "invitee instantiated team state");
        self.team = Some(Arc::new(Mutex::new(team)));

        // Re-enter authentication as an enrolled device.
        self.claim_sent = false;
        self.send_claim(now)?;

        if let Some(IdentityClaim::Member {
            user_name,
            device_id,
        }) = self.pending_claim.take()
        {
            self.handle_member_claim(user_name, device_id, now)?;
        }
        Ok(())
    }

    fn handle_challenge(&mut self, challenge: IdentityChallenge) -> Result<(), ConnectionError> {
        let (_, our_device) = self.local_identity()?;
        if challenge.device_id != our_device {
            return Err(ConnectionError::ProtocolViolation(format!(
                "challenged for foreign device {}",
                challenge.device_id
            )));
        }
        let signing = self.local_device_signing()?;
        let proof = signing.sign(&encode_cbor(&challenge)?);
        self.send(ConnectionMessage::ProveIdentity { challenge, proof });
        Ok(())
    }

    fn handle_proof(
        &mut self,
        challenge: IdentityChallenge,
        proof: huddle_crypto::ed25519::Signature,
        now: u64,
    ) -> Result<(), ConnectionError> {
        let Some(expected) = self.sent_challenge.clone() else {
            return Err(ConnectionError::ProtocolViolation(
                "proof without an outstanding challenge".to_string(),
            ));
        };
        if challenge != expected {
            return Err(ConnectionError::ProtocolViolation(
                "proof answers a different challenge".to_string(),
            ));
        }

        let signing_key = self.with_team(|team| {
            team.state()
                .device(&challenge.device_id)
                .map(|(_, device)| device.keys.signing)
        })?;

        let challenge_bytes = encode_cbor(&challenge)?;
        let verified = signing_key
            .map(|key| key.verify(&challenge_bytes, &proof).is_ok())
            .unwrap_or(false);
        if !verified {
            self.reject(format!(
                "identity proof for device {} does not verify",
                challenge.device_id
            ));
            return Ok(());
        }

        self.sent_challenge = None;
        self.we_accepted_peer = true;
        self.send(ConnectionMessage::AcceptIdentity);
        self.maybe_enter_sync(now)
    }

    fn maybe_enter_sync(&mut self, now: u64) -> Result<(), ConnectionError> {
        if !(self.we_accepted_peer && self.peer_accepted_us) {
            return Ok(());
        }
        if self.state != ConnectionState::Authenticating {
            return Ok(());
        }
        self.transition(ConnectionState::Synchronizing, now);
        self.send_summary()
    }

    fn handle_sync(&mut self, payload: SyncPayload, now: u64) -> Result<(), ConnectionError> {
        match payload {
            SyncPayload::Summary { head, known } => {
                self.their_head = Some(head);
                let (missing, our_head) = self.with_team(|team| {
                    (missing_links(team.graph(), &known), team.head())
                })?;
                if !missing.is_empty() {
                    self.send(ConnectionMessage::Sync {
                        payload: SyncPayload::Links {
                            head: our_head,
                            links: missing,
                        },
                    });
                }
                if head != our_head {
                    self.send_summary()?;
                }
                self.check_sync_complete(now)
            }
            SyncPayload::Links { head, links } => {
                self.their_head = Some(head);
                let (changed, our_head) =
                    self.with_team_mut(|team| -> Result<_, ConnectionError> {
                        let remote = assemble_remote(team.graph(), head, links)?;
                        let changed = team.merge_graph(&remote)?;
                        Ok((changed, team.head()))
                    })??;
                if changed {
                    self.events
                        .push_back(ConnectionEvent::Updated { head: our_head });
                }
                self.send_summary()?;
                self.check_sync_complete(now)
            }
        }
    }

    fn send_summary(&mut self) -> Result<(), ConnectionError> {
        let (head, known) =
            self.with_team(|team| (team.head(), known_hashes(team.graph())))?;
        if self.last_summary_head == Some(head) {
            return Ok(());
        }
        self.last_summary_head = Some(head);
        self.send(ConnectionMessage::Sync {
            payload: SyncPayload::Summary { head, known },
        });
        Ok(())
    }

    fn check_sync_complete(&mut self, now: u64) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Synchronizing {
            return Ok(());
        }
        let our_head = self.with_team(|team| team.head())?;
        if self.their_head != Some(our_head) {
            return Ok(());
        }
        self.enter_negotiating(now)
    }

    fn enter_negotiating(&mut self, now: u64) -> Result<(), ConnectionError> {
        self.transition(ConnectionState::Negotiating, now);

        let seed: [u8; 32] = self.rng.random_array()?;
        self.our_seed = Some(Secret::from_bytes(seed));

        let (peer_user, _) = self
            .peer
            .clone()
            .ok_or_else(|| {
                ConnectionError::ProtocolViolation("negotiating with an unknown peer".to_string())
            })?;
        let recipient = self
            .with_team(|team| {
                team.state()
                    .encryption_key(KeyScope::Member, &peer_user)
                    .map(|(_, key)| key)
            })?
            .ok_or_else(|| {
                ConnectionError::ProtocolViolation(format!(
                    "no encryption key known for peer {peer_user}"
                ))
            })?;

        let ephemeral = SecretKey::from_bytes(self.rng.random_array()?);
        let ciphertext = seal(&seed, &recipient, &ephemeral, &self.rng)?;
        self.send(ConnectionMessage::Seed {
            encrypted_seed: SealedPackage {
                sender: ephemeral.public_key(),
                ciphertext,
            },
        });
        self.seed_sent = true;
        self.try_establish(now)
    }

    fn handle_seed(
        &mut self,
        encrypted_seed: SealedPackage,
        now: u64,
    ) -> Result<(), ConnectionError> {
        let secret = self.local_member_encryption()?;
        let bytes = unseal(&encrypted_seed.ciphertext, &encrypted_seed.sender, &secret)
            .map_err(|_| ConnectionError::DecryptionFailed)?;
        let seed: [u8; 32] = bytes.try_into().map_err(|_| {
            ConnectionError::ProtocolViolation("seed contribution has the wrong size".to_string())
        })?;
        self.peer_seed = Some(Secret::from_bytes(seed));
        self.try_establish(now)
    }

    /// Once both contributions are known the session key is the domain hash
    /// of their sorted concatenation, identical on both ends.
    fn try_establish(&mut self, now: u64) -> Result<(), ConnectionError> {
        if self.state == ConnectionState::Connected || !self.seed_sent {
            return Ok(());
        }
        let (Some(ours), Some(theirs)) = (&self.our_seed, &self.peer_seed) else {
            return Ok(());
        };

        let (low, high) = if ours.as_bytes() <= theirs.as_bytes() {
            (ours.as_bytes(), theirs.as_bytes())
        } else {
            (theirs.as_bytes(), ours.as_bytes())
        };
        let mut both = Vec::with_capacity(64);
        both.extend_from_slice(low);
        both.extend_from_slice(high);

        self.session_key = Some(Secret::from_bytes(domain_hash(SESSION_DOMAIN, both).into()));
        self.transition(ConnectionState::Connected, now);
        self.events.push_back(ConnectionEvent::Connected);
        debug!(peer = ?self.peer, "connection established");
        Ok(())
    }

    // --- Local identity --------------------------------------------------

    fn local_identity(&self) -> Result<(String, String), ConnectionError> {
        if let Some(team) = &self.team {
            let guard = team.lock().map_err(|_| ConnectionError::TeamLock)?;
            return Ok((guard.user_name().to_string(), guard.device_id()));
        }
        let (context, _) = self.invitee.as_ref().ok_or(ConnectionError::NoTeam)?;
        Ok((
            context.user.user_name.clone(),
            context.device.device_id(),
        ))
    }

    fn local_device_signing(&self) -> Result<SigningKey, ConnectionError> {
        if let Some(team) = &self.team {
            let guard = team.lock().map_err(|_| ConnectionError::TeamLock)?;
            return Ok(guard.context().device.keys.signing.clone());
        }
        let (context, _) = self.invitee.as_ref().ok_or(ConnectionError::NoTeam)?;
        Ok(context.device.keys.signing.clone())
    }

    fn local_member_encryption(&self) -> Result<SecretKey, ConnectionError> {
        if let Some(team) = &self.team {
            let guard = team.lock().map_err(|_| ConnectionError::TeamLock)?;
            let user_name = guard.user_name().to_string();
            return Ok(guard
                .keyring()
                .get(KeyScope::Member, &user_name)?
                .encryption
                .clone());
        }
        let (context, _) = self.invitee.as_ref().ok_or(ConnectionError::NoTeam)?;
        Ok(context.user.keys.encryption.clone())
    }

    fn with_team<T>(&self, f: impl FnOnce(&Team) -> T) -> Result<T, ConnectionError> {
        let team = self.team.as_ref().ok_or(ConnectionError::NoTeam)?;
        let guard = team.lock().map_err(|_| ConnectionError::TeamLock)?;
        Ok(f(&guard))
    }

    fn with_team_mut<T>(&self, f: impl FnOnce(&mut Team) -> T) -> Result<T, ConnectionError> {
        let team = self.team.as_ref().ok_or(ConnectionError::NoTeam)?;
        let mut guard = team.lock().map_err(|_| ConnectionError::TeamLock)?;
        Ok(f(&mut guard))
    }

    // --- Plumbing --------------------------------------------------------

    fn send(&mut self, message: ConnectionMessage) {
        self.outbox.push_back(NumberedConnectionMessage {
            index: self.next_index,
            message,
        });
        self.next_index += 1;
    }

    fn transition(&mut self, state: ConnectionState, now: u64) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "transition");
            self.state = state;
            self.state_entered_at = now;
        }
    }

    /// Identity rejection: tell the peer why and hang up.
    fn reject(&mut self, message: String) {
        self.send(ConnectionMessage::RejectIdentity {
            message: message.clone(),
        });
        self.finish(DisconnectReason::Error(message));
    }

    /// Local failure mid-protocol: surface it, tell the peer, hang up.
    fn fail(&mut self, message: &str) {
        if matches!(self.state, ConnectionState::Disconnected(_)) {
            return;
        }
        self.events
            .push_back(ConnectionEvent::LocalError(message.to_string()));
        self.send(ConnectionMessage::Disconnect {
            message: message.to_string(),
        });
        self.finish(DisconnectReason::Error(message.to_string()));
    }

    fn finish(&mut self, reason: DisconnectReason) {
        self.state = ConnectionState::Disconnected(reason.clone());
        self.events
            .push_back(ConnectionEvent::Disconnected(reason));
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection is closed")]
    Closed,

    #[error("connection has not been started")]
    NotStarted,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("no team is attached to this connection")]
    NoTeam,

    #[error("team lock is poisoned")]
    TeamLock,

    #[error("message could not be decrypted")]
    DecryptionFailed,

    #[error("connection is not established")]
    NotConnected,

    #[error(transparent)]
    Team(#[from] TeamError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Invitation(#[from] InvitationError),

    #[error(transparent)]
    Keyring(#[from] KeyringError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Seal(#[from] SealError),

    #[error(transparent)]
    Aead(#[from] AeadError),
}
