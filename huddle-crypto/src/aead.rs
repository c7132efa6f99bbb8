// SPDX-License-Identifier: MIT OR Apache-2.0

//! XChaCha20-Poly1305 authenticated encryption with a 24-byte nonce
//! prepended to the ciphertext, so the output is self-contained.
use chacha20poly1305::{AeadInPlace, Key, KeyInit, XChaCha20Poly1305, XNonce};
use thiserror::Error;

use crate::{Rng, RngError};

/// 192-bit nonce.
pub const AEAD_NONCE_SIZE: usize = 24;

/// 256-bit key.
pub type AeadKey = [u8; 32];

/// Encrypt `plaintext` under `key`, returning `nonce || ciphertext || tag`.
pub fn aead_encrypt(
    key: &AeadKey,
    plaintext: &[u8],
    aad: Option<&[u8]>,
    rng: &Rng,
) -> Result<Vec<u8>, AeadError> {
    let nonce: [u8; AEAD_NONCE_SIZE] = rng.random_array()?;

    let mut out = Vec::with_capacity(AEAD_NONCE_SIZE + plaintext.len() + 16);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(plaintext);

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let tag = cipher
        .encrypt_in_place_detached(
            XNonce::from_slice(&nonce),
            aad.unwrap_or_default(),
            &mut out[AEAD_NONCE_SIZE..],
        )
        .map_err(AeadError::Encrypt)?;
    out.extend_from_slice(&tag);

    Ok(out)
}

/// Decrypt bytes produced by [`aead_encrypt`].
pub fn aead_decrypt(key: &AeadKey, bytes: &[u8], aad: Option<&[u8]>) -> Result<Vec<u8>, AeadError> {
    if bytes.len() < AEAD_NONCE_SIZE {
        return Err(AeadError::MalformedCiphertext);
    }
    let (nonce, ciphertext) = bytes.split_at(AEAD_NONCE_SIZE);

    let mut plaintext: Vec<u8> = Vec::from(ciphertext);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt_in_place(
            XNonce::from_slice(nonce),
            aad.unwrap_or_default(),
            &mut plaintext,
        )
        .map_err(AeadError::Decrypt)?;

    Ok(plaintext)
}

#[derive(Debug, Error)]
pub enum AeadError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error("ciphertext is too short to contain a nonce")]
    MalformedCiphertext,

    #[error("plaintext could not be encrypted: {0}")]
    Encrypt(chacha20poly1305::Error),

    #[error("ciphertext could not be decrypted: {0}")]
    Decrypt(chacha20poly1305::Error),
}
