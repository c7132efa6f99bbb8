// SPDX-License-Identifier: MIT OR Apache-2.0

//! Canonical CBOR encoding.
//!
//! CBOR bytes are the canonical form used for hashing and signing: every
//! peer encodes the same struct layout, so the bytes match bit-for-bit.
use ciborium::de::Error as DeserializeError;
use ciborium::ser::Error as SerializeError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodeError> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes).map_err(Into::<EncodeError>::into)?;
    Ok(bytes)
}

pub fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DecodeError> {
    let value = ciborium::de::from_reader(bytes).map_err(Into::<DecodeError>::into)?;
    Ok(value)
}

#[derive(Debug, Error)]
pub enum EncodeError {
    /// An error occurred while writing bytes.
    #[error("an error occurred while writing bytes: {0}")]
    Io(std::io::Error),

    /// A value cannot be serialized.
    #[error("an error occurred while serializing value: {0}")]
    Value(String),
}

impl From<SerializeError<std::io::Error>> for EncodeError {
    fn from(value: SerializeError<std::io::Error>) -> Self {
        match value {
            SerializeError::Io(err) => EncodeError::Io(err),
            SerializeError::Value(err) => EncodeError::Value(err),
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    /// An error occurred while reading bytes.
    #[error("an error occurred while reading bytes: {0}")]
    Io(std::io::Error),

    /// A syntax error occurred at the given offset.
    #[error("an error occurred while parsing bytes at position {0}")]
    Syntax(usize),

    /// A parsed value could not be processed.
    #[error("an error occurred while processing a parsed value at position {0:?}: {1}")]
    Semantic(Option<usize>, String),

    /// The input caused serde to recurse too much.
    #[error("recursion limit exceeded while decoding")]
    RecursionLimitExceeded,
}

impl From<DeserializeError<std::io::Error>> for DecodeError {
    fn from(value: DeserializeError<std::io::Error>) -> Self {
        match value {
            DeserializeError::Io(err) => DecodeError::Io(err),
            DeserializeError::Syntax(offset) => DecodeError::Syntax(offset),
            DeserializeError::Semantic(offset, description) => {
                DecodeError::Semantic(offset, description)
            }
            DeserializeError::RecursionLimitExceeded => DecodeError::RecursionLimitExceeded,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::{decode_cbor, encode_cbor};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
        generation: u32,
    }

    #[test]
    fn encode_decode() {
        let record = Record {
            name: "alice".to_string(),
            generation: 3,
        };

        let bytes = encode_cbor(&record).unwrap();
        let record_again: Record = decode_cbor(&bytes).unwrap();
        assert_eq!(record, record_again);
    }

    #[test]
    fn canonical_bytes_are_stable() {
        let record = Record {
            name: "alice".to_string(),
            generation: 3,
        };
        assert_eq!(encode_cbor(&record).unwrap(), encode_cbor(&record).unwrap());
    }
}
