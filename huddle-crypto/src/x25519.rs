// SPDX-License-Identifier: MIT OR Apache-2.0

//! X25519 elliptic-curve Diffie-Hellman key agreement.
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

pub const SECRET_KEY_SIZE: usize = 32;
pub const PUBLIC_KEY_SIZE: usize = 32;
pub const AGREEMENT_SIZE: usize = 32;

/// X25519 secret key.
#[derive(Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SecretKey(#[serde(with = "serde_bytes")] [u8; SECRET_KEY_SIZE]);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        // Clamping
        let mut bytes = bytes;
        bytes[0] &= 248u8;
        bytes[31] &= 127u8;
        bytes[31] |= 64u8;
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        &self.0
    }

    pub fn public_key(&self) -> PublicKey {
        let secret = x25519_dalek::StaticSecret::from(self.0);
        PublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes())
    }

    pub fn calculate_agreement(&self, their_public: &PublicKey) -> [u8; AGREEMENT_SIZE] {
        let secret = x25519_dalek::StaticSecret::from(self.0);
        let public = x25519_dalek::PublicKey::from(their_public.0);
        *secret.diffie_hellman(&public).as_bytes()
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey").field("scalar", &"***").finish()
    }
}

/// Public half of an X25519 key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use crate::Rng;

    use super::SecretKey;

    #[test]
    fn diffie_hellman() {
        let rng = Rng::from_seed([1; 32]);

        let alice_secret = SecretKey::from_bytes(rng.random_array().unwrap());
        let bob_secret = SecretKey::from_bytes(rng.random_array().unwrap());

        let alice_shared = alice_secret.calculate_agreement(&bob_secret.public_key());
        let bob_shared = bob_secret.calculate_agreement(&alice_secret.public_key());

        assert_eq!(alice_shared, bob_shared);
    }
}
