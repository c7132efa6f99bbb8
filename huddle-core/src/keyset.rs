// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scoped, named, generation-versioned keysets.
//!
//! A keyset bundles a signing keypair and an encryption keypair under an
//! address `(scope, name, generation)`. Generations are only ever
//! incremented by rotation; old keysets stay valid for verifying historic
//! material. Secret halves never appear on the graph, only the public form
//! does.
use std::fmt;

use huddle_crypto::aead::AeadKey;
use huddle_crypto::ed25519::{SigningKey, VerifyingKey};
use huddle_crypto::kdf::{stretch, KdfError};
use huddle_crypto::x25519::{PublicKey, SecretKey};
use huddle_crypto::{domain_hash, Rng, RngError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const SIGNING_DOMAIN: &str = "huddle/keyset/signing";
const ENCRYPTION_DOMAIN: &str = "huddle/keyset/encryption";
const AEAD_DOMAIN: &str = "huddle/keyset/aead";

/// Namespace a keyset belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyScope {
    Team,
    Role,
    Member,
    Device,
    Server,
    Ephemeral,
}

impl fmt::Display for KeyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            KeyScope::Team => "TEAM",
            KeyScope::Role => "ROLE",
            KeyScope::Member => "MEMBER",
            KeyScope::Device => "DEVICE",
            KeyScope::Server => "SERVER",
            KeyScope::Ephemeral => "EPHEMERAL",
        };
        write!(f, "{label}")
    }
}

/// Identity of a keyset: equality of keysets is equality of addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeysetAddress {
    pub scope: KeyScope,
    pub name: String,
    pub generation: u32,
}

impl KeysetAddress {
    pub fn new(scope: KeyScope, name: impl Into<String>, generation: u32) -> Self {
        Self {
            scope,
            name: name.into(),
            generation,
        }
    }
}

impl fmt::Display for KeysetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.scope, self.name, self.generation)
    }
}

/// A keyset including its secret halves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keyset {
    pub scope: KeyScope,
    pub name: String,
    pub generation: u32,
    pub signing: SigningKey,
    pub encryption: SecretKey,
}

impl Keyset {
    /// Derive a keyset from 32 bytes of uniform key material.
    fn derive(scope: KeyScope, name: String, generation: u32, material: [u8; 32]) -> Self {
        let signing_seed: [u8; 32] = domain_hash(SIGNING_DOMAIN, material).into();
        let encryption_seed: [u8; 32] = domain_hash(ENCRYPTION_DOMAIN, material).into();
        Self {
            scope,
            name,
            generation,
            signing: SigningKey::from_bytes(signing_seed),
            encryption: SecretKey::from_bytes(encryption_seed),
        }
    }

    /// Create a keyset at generation 0 from fresh randomness.
    pub fn generate(
        scope: KeyScope,
        name: impl Into<String>,
        rng: &Rng,
    ) -> Result<Self, KeysetError> {
        Ok(Self::derive(scope, name.into(), 0, rng.random_array()?))
    }

    /// Create a keyset at generation 0 by stretching a low-entropy seed.
    ///
    /// Stretching makes brute-forcing the seed expensive; both parties of an
    /// invitation derive the identical keyset from the shared seed.
    pub fn from_seed(
        scope: KeyScope,
        name: impl Into<String>,
        seed: &str,
    ) -> Result<Self, KeysetError> {
        Ok(Self::derive(scope, name.into(), 0, stretch(seed.as_bytes())?))
    }

    /// Issue the next generation of this keyset with fresh key material.
    ///
    /// The current keyset is left untouched; holders keep it for opening
    /// historic lockboxes.
    pub fn rotate(&self, rng: &Rng) -> Result<Self, KeysetError> {
        Ok(Self::derive(
            self.scope,
            self.name.clone(),
            self.generation + 1,
            rng.random_array()?,
        ))
    }

    pub fn address(&self) -> KeysetAddress {
        KeysetAddress::new(self.scope, self.name.clone(), self.generation)
    }

    /// Symmetric key for scope-wide AEAD, derived from the secret encryption
    /// key. Every holder of the keyset derives the same key.
    pub fn aead_key(&self) -> AeadKey {
        domain_hash(AEAD_DOMAIN, self.encryption.as_bytes()).into()
    }

    /// Strip the secret halves.
    pub fn public(&self) -> PublicKeyset {
        PublicKeyset {
            scope: self.scope,
            name: self.name.clone(),
            generation: self.generation,
            signing: self.signing.verifying_key(),
            encryption: self.encryption.public_key(),
        }
    }
}

impl PartialEq for Keyset {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl Eq for Keyset {}

/// Public form of a keyset, safe to post on the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyset {
    pub scope: KeyScope,
    pub name: String,
    pub generation: u32,
    pub signing: VerifyingKey,
    pub encryption: PublicKey,
}

impl PublicKeyset {
    pub fn address(&self) -> KeysetAddress {
        KeysetAddress::new(self.scope, self.name.clone(), self.generation)
    }
}

#[derive(Debug, Error)]
pub enum KeysetError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Kdf(#[from] KdfError),
}
