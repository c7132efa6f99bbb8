// SPDX-License-Identifier: MIT OR Apache-2.0

//! Authenticated asymmetric sealing.
//!
//! `seal` binds a sender to a recipient: the X25519 agreement between the
//! sender's secret key and the recipient's public key is expanded through
//! HKDF into an AEAD key. Callers that need sender anonymity (lockboxes)
//! pass a single-use ephemeral secret and ship its public half alongside
//! the ciphertext.
use thiserror::Error;

use crate::aead::{aead_decrypt, aead_encrypt, AeadError};
use crate::hkdf::{hkdf, HkdfError};
use crate::x25519::{PublicKey, SecretKey};
use crate::Rng;

const SEAL_INFO: &[u8] = b"huddle/seal/v1";

fn seal_key(agreement: &[u8; 32]) -> Result<[u8; 32], HkdfError> {
    hkdf(&[], agreement, Some(SEAL_INFO))
}

/// Seal `plaintext` from `sender_secret` to `recipient_public`.
pub fn seal(
    plaintext: &[u8],
    recipient_public: &PublicKey,
    sender_secret: &SecretKey,
    rng: &Rng,
) -> Result<Vec<u8>, SealError> {
    let agreement = sender_secret.calculate_agreement(recipient_public);
    let key = seal_key(&agreement)?;
    Ok(aead_encrypt(&key, plaintext, None, rng)?)
}

/// Open bytes sealed by `sender_public` for `recipient_secret`.
pub fn unseal(
    bytes: &[u8],
    sender_public: &PublicKey,
    recipient_secret: &SecretKey,
) -> Result<Vec<u8>, SealError> {
    let agreement = recipient_secret.calculate_agreement(sender_public);
    let key = seal_key(&agreement)?;
    Ok(aead_decrypt(&key, bytes, None)?)
}

#[derive(Debug, Error)]
pub enum SealError {
    #[error(transparent)]
    Hkdf(#[from] HkdfError),

    #[error(transparent)]
    Aead(#[from] AeadError),
}
