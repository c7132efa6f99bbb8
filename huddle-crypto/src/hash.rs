// SPDX-License-Identifier: MIT OR Apache-2.0

//! Domain-separated BLAKE3 hashes.
//!
//! Every hash in huddle is bound to a domain tag so that values computed for
//! one purpose (link ids, invitation ids, session keys, ...) can never
//! collide with values computed for another.
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Length of a hash in bytes.
pub const HASH_LEN: usize = 32;

/// 32-byte BLAKE3 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; HASH_LEN]);

/// Hash `data` under the given domain tag.
pub fn domain_hash(domain: &str, data: impl AsRef<[u8]>) -> Hash {
    Hash(blake3::derive_key(domain, data.as_ref()))
}

impl Hash {
    /// Create a `Hash` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Bytes of the hash.
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Convert the hash to a lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; HASH_LEN]> for Hash {
    fn from(value: [u8; HASH_LEN]) -> Self {
        Self(value)
    }
}

impl From<Hash> for [u8; HASH_LEN] {
    fn from(value: Hash) -> Self {
        value.0
    }
}

impl TryFrom<&[u8]> for Hash {
    type Error = HashError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let checked: [u8; HASH_LEN] = value
            .try_into()
            .map_err(|_| HashError::InvalidLength(value.len(), HASH_LEN))?;
        Ok(Self(checked))
    }
}

impl FromStr for Hash {
    type Err = HashError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::try_from(hex::decode(value)?.as_slice())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

/// Error types for the `Hash` struct.
#[derive(Error, Debug)]
pub enum HashError {
    /// Hash byte string has an invalid length.
    #[error("invalid hash length {0} bytes, expected {1} bytes")]
    InvalidLength(usize, usize),

    /// Hash string contains invalid hexadecimal characters.
    #[error("invalid hex encoding in hash string")]
    InvalidHexEncoding(#[from] hex::FromHexError),
}

#[cfg(test)]
mod tests {
    use super::{domain_hash, Hash, HashError};

    #[test]
    fn domains_separate() {
        let hash_1 = domain_hash("huddle/test/one", b"payload");
        let hash_2 = domain_hash("huddle/test/two", b"payload");
        let hash_3 = domain_hash("huddle/test/one", b"payload");

        assert_ne!(hash_1, hash_2);
        assert_eq!(hash_1, hash_3);
    }

    #[test]
    fn hex_round_trip() {
        let hash = domain_hash("huddle/test", [1, 2, 3]);
        let parsed: Hash = hash.to_hex().parse().unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn invalid_length() {
        let bytes = vec![254, 100, 4, 7];
        let result: Result<Hash, HashError> = bytes.as_slice().try_into();
        assert!(matches!(result, Err(HashError::InvalidLength(4, 32))));
    }

    #[test]
    fn invalid_hex_encoding() {
        let result: Result<Hash, HashError> = "notreallyahexstring".parse();
        assert!(matches!(result, Err(HashError::InvalidHexEncoding(_))));
    }
}
