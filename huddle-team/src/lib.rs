// SPDX-License-Identifier: MIT OR Apache-2.0

//! Team semantics on top of the huddle signature graph.
//!
//! The graph stores [`TeamAction`] payloads; [`reduce`] folds a linearized
//! graph into a [`TeamState`] by running a per-action validator followed by
//! a pure transform for every link. [`Team`] is the host-facing instance
//! wrapping graph, state and keyring behind one serial mutation path.
//!
//! Concurrency between peers resolves through the [`MembershipResolver`]:
//! concurrent branches order deterministically and writes by concurrently
//! removed members are dropped, so every peer converges on the same state.
mod action;
pub mod invitation;
mod member;
mod reduce;
mod resolver;
mod rotation;
mod state;
mod team;
mod validate;

pub use action::TeamAction;
pub use invitation::{InvitationError, InvitationParams, ProofOfInvitation, ProofPayload};
pub use member::{InvitationType, Member, PostedInvitation, Role, ADMIN_ROLE};
pub use reduce::{apply, reduce, ReduceError};
pub use resolver::MembershipResolver;
pub use rotation::{holders, plan_rotation, scopes_to_rotate, RotationPlan, ScopeKey};
pub use state::{RootContext, TeamState};
pub use team::{
    Envelope, InviteOptions, SignatureEnvelope, Team, TeamError, TeamEvent,
};
pub use validate::{validate, ValidationError};
