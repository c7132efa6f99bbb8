// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ed25519 digital signatures.
use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::ZeroizeOnDrop;

pub const SIGNING_KEY_SIZE: usize = 32;
pub const VERIFYING_KEY_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

/// Ed25519 signing key held as its 32-byte seed.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SigningKey(#[serde(with = "serde_bytes")] [u8; SIGNING_KEY_SIZE]);

impl SigningKey {
    pub fn from_bytes(bytes: [u8; SIGNING_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SIGNING_KEY_SIZE] {
        &self.0
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        let key = ed25519_dalek::SigningKey::from_bytes(&self.0);
        VerifyingKey(key.verifying_key().to_bytes())
    }

    pub fn sign(&self, bytes: &[u8]) -> Signature {
        let key = ed25519_dalek::SigningKey::from_bytes(&self.0);
        Signature(key.sign(bytes).to_bytes())
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey").field("seed", &"***").finish()
    }
}

/// Public half of a signing key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VerifyingKey([u8; VERIFYING_KEY_SIZE]);

impl VerifyingKey {
    pub fn from_bytes(bytes: [u8; VERIFYING_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; VERIFYING_KEY_SIZE] {
        &self.0
    }

    pub fn verify(&self, bytes: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        let key = ed25519_dalek::VerifyingKey::from_bytes(&self.0)
            .map_err(|_| SignatureError::InvalidPublicKey)?;
        let signature = ed25519_dalek::Signature::from_bytes(&signature.0);
        key.verify(bytes, &signature)
            .map_err(|_| SignatureError::VerificationFailed)
    }
}

/// Detached Ed25519 signature.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Signature([u8; SIGNATURE_SIZE]);

impl Signature {
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({})", hex::encode(self.0))
    }
}

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("signature does not match public key and payload")]
    VerificationFailed,

    #[error("bytes do not form a valid ed25519 public key")]
    InvalidPublicKey,
}

#[cfg(test)]
mod tests {
    use crate::Rng;

    use super::{SignatureError, SigningKey};

    #[test]
    fn sign_and_verify() {
        let rng = Rng::from_seed([1; 32]);

        let signing_key = SigningKey::from_bytes(rng.random_array().unwrap());
        let verifying_key = signing_key.verifying_key();

        let signature = signing_key.sign(b"an important claim");
        assert!(verifying_key.verify(b"an important claim", &signature).is_ok());
    }

    #[test]
    fn failed_verify() {
        let rng = Rng::from_seed([1; 32]);

        let signing_key = SigningKey::from_bytes(rng.random_array().unwrap());
        let verifying_key = signing_key.verifying_key();
        let signature = signing_key.sign(b"an important claim");

        let other_key = SigningKey::from_bytes(rng.random_array().unwrap());
        let other_verifying_key = other_key.verifying_key();
        let other_signature = other_key.sign(b"an important claim");

        assert!(matches!(
            verifying_key.verify(b"a different claim", &signature),
            Err(SignatureError::VerificationFailed)
        ));
        assert!(matches!(
            other_verifying_key.verify(b"an important claim", &signature),
            Err(SignatureError::VerificationFailed)
        ));
        assert!(matches!(
            verifying_key.verify(b"an important claim", &other_signature),
            Err(SignatureError::VerificationFailed)
        ));
    }
}
