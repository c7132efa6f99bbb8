// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lockboxes distribute secret keysets to recipients.
//!
//! A lockbox sealed to keyset R holding keyset C means: any holder of R's
//! secret encryption key can recover the full keyset C. The sender side of
//! the seal is a single-use ephemeral keypair whose public half travels in
//! the lockbox, so lockboxes reveal nothing about who sealed them.
use huddle_crypto::seal::{seal, unseal, SealError};
use huddle_crypto::x25519::{PublicKey, SecretKey};
use huddle_crypto::{Rng, RngError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cbor::{decode_cbor, encode_cbor, DecodeError, EncodeError};
use crate::keyset::{Keyset, KeysetAddress, PublicKeyset};
use huddle_crypto::serde::{deserialize_hex, serialize_hex};

/// One end of a lockbox: a keyset address plus its public encryption key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockboxParty {
    pub address: KeysetAddress,
    pub public_key: PublicKey,
}

/// A secret keyset sealed to a recipient keyset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lockbox {
    /// Public half of the single-use sender keypair.
    pub ephemeral_public: PublicKey,

    /// Who can open this lockbox.
    pub recipient: LockboxParty,

    /// Which keyset is inside, in public-address form.
    pub contents: LockboxParty,

    #[serde(serialize_with = "serialize_hex", deserialize_with = "deserialize_hex")]
    pub ciphertext: Vec<u8>,
}

impl Lockbox {
    /// Seal the full `contents` keyset to `recipient`.
    pub fn seal(
        contents: &Keyset,
        recipient: &PublicKeyset,
        rng: &Rng,
    ) -> Result<Self, LockboxError> {
        let ephemeral = SecretKey::from_bytes(rng.random_array()?);
        let payload = encode_cbor(contents)?;
        let ciphertext = seal(&payload, &recipient.encryption, &ephemeral, rng)?;

        Ok(Self {
            ephemeral_public: ephemeral.public_key(),
            recipient: LockboxParty {
                address: recipient.address(),
                public_key: recipient.encryption,
            },
            contents: LockboxParty {
                address: contents.address(),
                public_key: contents.encryption.public_key(),
            },
            ciphertext,
        })
    }

    /// Open the lockbox with the recipient's secret encryption key.
    pub fn open(&self, recipient_secret: &SecretKey) -> Result<Keyset, LockboxError> {
        let payload = unseal(&self.ciphertext, &self.ephemeral_public, recipient_secret)
            .map_err(|_| LockboxError::DecryptionFailed)?;
        let keyset: Keyset = decode_cbor(&payload)?;

        // The advertised contents address must match what is actually inside.
        if keyset.address() != self.contents.address {
            return Err(LockboxError::ContentsMismatch {
                advertised: self.contents.address.clone(),
                actual: keyset.address(),
            });
        }

        Ok(keyset)
    }

    /// Re-seal to the same recipient key with the next generation of the
    /// contents keyset.
    pub fn rotate(&self, new_contents: &Keyset, rng: &Rng) -> Result<Self, LockboxError> {
        if new_contents.generation != self.contents.address.generation + 1 {
            return Err(LockboxError::NotNextGeneration {
                current: self.contents.address.generation,
                offered: new_contents.generation,
            });
        }

        let ephemeral = SecretKey::from_bytes(rng.random_array()?);
        let payload = encode_cbor(new_contents)?;
        let ciphertext = seal(&payload, &self.recipient.public_key, &ephemeral, rng)?;

        Ok(Self {
            ephemeral_public: ephemeral.public_key(),
            recipient: self.recipient.clone(),
            contents: LockboxParty {
                address: new_contents.address(),
                public_key: new_contents.encryption.public_key(),
            },
            ciphertext,
        })
    }
}

#[derive(Debug, Error)]
pub enum LockboxError {
    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Seal(#[from] SealError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("lockbox could not be decrypted with the given key")]
    DecryptionFailed,

    #[error("lockbox advertises {advertised} but contains {actual}")]
    ContentsMismatch {
        advertised: KeysetAddress,
        actual: KeysetAddress,
    },

    #[error("rotated contents must be at generation {current} + 1, got {offered}")]
    NotNextGeneration { current: u32, offered: u32 },
}

#[cfg(test)]
mod tests {
    use huddle_crypto::Rng;

    use crate::keyset::{KeyScope, Keyset};

    use super::{Lockbox, LockboxError};

    #[test]
    fn seal_and_open() {
        let rng = Rng::from_seed([1; 32]);

        let team_keys = Keyset::generate(KeyScope::Team, "t", &rng).unwrap();
        let member_keys = Keyset::generate(KeyScope::Member, "alice", &rng).unwrap();

        let lockbox = Lockbox::seal(&team_keys, &member_keys.public(), &rng).unwrap();
        let opened = lockbox.open(&member_keys.encryption).unwrap();

        assert_eq!(opened.address(), team_keys.address());
        assert_eq!(
            opened.signing.verifying_key(),
            team_keys.signing.verifying_key()
        );
    }

    #[test]
    fn wrong_recipient_cannot_open() {
        let rng = Rng::from_seed([1; 32]);

        let team_keys = Keyset::generate(KeyScope::Team, "t", &rng).unwrap();
        let member_keys = Keyset::generate(KeyScope::Member, "alice", &rng).unwrap();
        let intruder_keys = Keyset::generate(KeyScope::Member, "eve", &rng).unwrap();

        let lockbox = Lockbox::seal(&team_keys, &member_keys.public(), &rng).unwrap();
        assert!(matches!(
            lockbox.open(&intruder_keys.encryption),
            Err(LockboxError::DecryptionFailed)
        ));
    }

    #[test]
    fn rotate_keeps_recipient_and_bumps_generation() {
        let rng = Rng::from_seed([1; 32]);

        let team_keys = Keyset::generate(KeyScope::Team, "t", &rng).unwrap();
        let member_keys = Keyset::generate(KeyScope::Member, "alice", &rng).unwrap();

        let lockbox = Lockbox::seal(&team_keys, &member_keys.public(), &rng).unwrap();

        let next_team_keys = team_keys.rotate(&rng).unwrap();
        let rotated = lockbox.rotate(&next_team_keys, &rng).unwrap();

        assert_eq!(rotated.recipient, lockbox.recipient);
        assert_eq!(rotated.contents.address.generation, 1);
        assert_eq!(
            rotated.open(&member_keys.encryption).unwrap().address(),
            next_team_keys.address()
        );

        // Skipping a generation is rejected.
        let skipped = next_team_keys.rotate(&rng).unwrap();
        assert!(matches!(
            lockbox.rotate(&skipped, &rng),
            Err(LockboxError::NotNextGeneration {
                current: 0,
                offered: 2
            })
        ));
    }
}
