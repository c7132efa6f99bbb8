// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deliberately slow key stretching for low-entropy secrets (invitation
//! seeds, passwords).
//!
//! Argon2id with a fixed domain salt: both ends of an invitation must derive
//! identical bytes from the shared seed, so the salt cannot be random.
use argon2::Argon2;
use thiserror::Error;

/// Size of stretched output.
pub const STRETCH_SIZE: usize = 32;

const STRETCH_SALT: &[u8] = b"huddle/stretch/v1";

/// Stretch a low-entropy secret into 32 bytes of key material.
pub fn stretch(secret: &[u8]) -> Result<[u8; STRETCH_SIZE], KdfError> {
    let mut out = [0u8; STRETCH_SIZE];
    Argon2::default()
        .hash_password_into(secret, STRETCH_SALT, &mut out)
        .map_err(|_| KdfError::StretchFailed)?;
    Ok(out)
}

#[derive(Debug, Error)]
pub enum KdfError {
    #[error("could not stretch secret")]
    StretchFailed,
}

#[cfg(test)]
mod tests {
    use super::stretch;

    #[test]
    fn deterministic() {
        assert_eq!(stretch(b"abcd-efgh").unwrap(), stretch(b"abcd-efgh").unwrap());
        assert_ne!(stretch(b"abcd-efgh").unwrap(), stretch(b"abcd-efgi").unwrap());
    }
}
