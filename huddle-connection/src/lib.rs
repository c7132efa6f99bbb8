// SPDX-License-Identifier: MIT OR Apache-2.0

//! Pairwise connection protocol for huddle.
//!
//! A [`Connection`] mutually authenticates two peers (by identity challenge
//! for enrolled devices, by invitation proof for newcomers), converges
//! their graphs through summary/delta sync rounds and negotiates a shared
//! session key from sealed random contributions. The machine is sans-IO:
//! the host moves [`NumberedConnectionMessage`]s between peers over any
//! ordered byte channel and drains [`ConnectionEvent`]s.
mod connection;
mod message;
pub mod sync;

pub use connection::{
    Connection, ConnectionError, ConnectionEvent, ConnectionState, DisconnectReason,
    DEFAULT_TIMEOUT_MS,
};
pub use message::{
    ConnectionMessage, IdentityChallenge, IdentityClaim, NumberedConnectionMessage, SealedPackage,
    SyncPayload,
};
