// SPDX-License-Identifier: MIT OR Apache-2.0

//! HMAC-based key derivation function (HKDF) with SHA256.
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

pub fn hkdf<const N: usize>(
    salt: &[u8],
    ikm: &[u8],
    info: Option<&[u8]>,
) -> Result<[u8; N], HkdfError> {
    let salt = if salt.is_empty() { None } else { Some(salt) };
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; N];
    hk.expand(info.unwrap_or_default(), &mut okm)
        .map_err(|_| HkdfError::InvalidArguments)?;
    Ok(okm)
}

#[derive(Debug, Error)]
pub enum HkdfError {
    #[error("arguments too large for hkdf")]
    InvalidArguments,
}

#[cfg(test)]
mod tests {
    use super::hkdf;

    #[test]
    fn deterministic_and_info_bound() {
        let okm_1: [u8; 32] = hkdf(b"salt", b"input keying material", Some(b"info")).unwrap();
        let okm_2: [u8; 32] = hkdf(b"salt", b"input keying material", Some(b"info")).unwrap();
        let okm_3: [u8; 32] = hkdf(b"salt", b"input keying material", Some(b"other")).unwrap();

        assert_eq!(okm_1, okm_2);
        assert_ne!(okm_1, okm_3);
    }
}
