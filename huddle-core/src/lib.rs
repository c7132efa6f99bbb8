// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core data types for huddle: scoped keysets, lockboxes and keyrings for
//! key distribution, the hash-linked signature graph with deterministic
//! linearization, and the identity entities (users, devices, servers) that
//! author links.
//!
//! The graph is generic over its payload type; the team semantics living on
//! top of it are provided by the `huddle-team` crate.
pub mod cbor;
mod context;
pub mod graph;
mod keyring;
mod keyset;
mod lockbox;
mod time;

pub use context::{
    device_id, Device, InviteeContext, LocalContext, LocalUser, MemberContext, PublicDevice,
    Server, ServerContext,
};
pub use keyring::{Keyring, KeyringError};
pub use keyset::{KeyScope, Keyset, KeysetAddress, KeysetError, PublicKeyset};
pub use lockbox::{Lockbox, LockboxError, LockboxParty};
pub use time::now_ms;
