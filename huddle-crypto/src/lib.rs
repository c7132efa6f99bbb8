// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic primitives for huddle.
//!
//! A thin, uniform facade over the algorithms the rest of the workspace
//! builds on:
//!
//! - Ed25519 signatures ([`ed25519`])
//! - X25519 key agreement ([`x25519`])
//! - XChaCha20-Poly1305 AEAD with self-contained nonces ([`aead`])
//! - Authenticated asymmetric sealing, agreement + HKDF + AEAD ([`seal`])
//! - Argon2id password stretching ([`kdf`])
//! - Domain-separated BLAKE3 hashing ([`Hash`], [`domain_hash`])
//! - A ChaCha20 CSPRNG ([`Rng`])
//!
//! All byte outputs are encoded as lowercase hex when serialized into
//! human-readable formats and as raw byte strings in CBOR; see [`serde`].
//! Secret key material zeroizes on drop and never leaks through `Debug`.
pub mod aead;
pub mod ed25519;
mod hash;
pub mod hkdf;
pub mod kdf;
mod rng;
pub mod seal;
mod secret;
pub mod serde;
pub mod x25519;

pub use hash::{domain_hash, Hash, HashError, HASH_LEN};
pub use rng::{Rng, RngError};
pub use secret::Secret;
