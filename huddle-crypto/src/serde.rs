// SPDX-License-Identifier: MIT OR Apache-2.0

//! Serde helpers encoding bytes as lowercase hex in human-readable formats
//! (JSON) and as raw byte strings otherwise (CBOR).
use serde::{Deserialize, Serialize};
use serde_bytes::{ByteBuf as SerdeByteBuf, Bytes as SerdeBytes};

use crate::ed25519::{Signature, VerifyingKey, SIGNATURE_SIZE, VERIFYING_KEY_SIZE};
use crate::hash::{Hash, HashError};
use crate::x25519::{PublicKey, PUBLIC_KEY_SIZE};

/// Serialize bytes into a hex string when using a human-readable encoding,
/// otherwise serialize the bytes directly.
pub fn serialize_hex<S>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    if serializer.is_human_readable() {
        hex::encode(value).serialize(serializer)
    } else {
        SerdeBytes::new(value).serialize(serializer)
    }
}

/// Deserialize from a hex string into bytes when using a human-readable
/// encoding, otherwise deserialize the bytes directly.
pub fn deserialize_hex<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    if deserializer.is_human_readable() {
        let hex_string = String::deserialize(deserializer)?;
        hex::decode(&hex_string).map_err(serde::de::Error::custom)
    } else {
        let bytes = <SerdeByteBuf>::deserialize(deserializer)?;
        Ok(bytes.into_vec())
    }
}

fn fixed_bytes<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
where
    D: serde::Deserializer<'de>,
{
    let bytes = deserialize_hex(deserializer)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| serde::de::Error::custom(format!("expected {N} bytes, found {len}")))
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serialize_hex(self.as_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = deserialize_hex(deserializer)?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|err: HashError| serde::de::Error::custom(err.to_string()))
    }
}

impl Serialize for VerifyingKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serialize_hex(self.as_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for VerifyingKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(VerifyingKey::from_bytes(fixed_bytes::<
            D,
            VERIFYING_KEY_SIZE,
        >(deserializer)?))
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serialize_hex(self.as_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Signature::from_bytes(fixed_bytes::<D, SIGNATURE_SIZE>(
            deserializer,
        )?))
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serialize_hex(self.as_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(PublicKey::from_bytes(fixed_bytes::<D, PUBLIC_KEY_SIZE>(
            deserializer,
        )?))
    }
}
