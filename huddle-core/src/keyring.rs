// SPDX-License-Identifier: MIT OR Apache-2.0

//! The set of keysets a principal can reach.
//!
//! Starting from a principal's own keysets, the keyring grows by opening
//! every lockbox in team state whose recipient it already holds, iterating
//! to fixpoint. The relation "R holds C" is data (a lockbox), never an
//! in-memory pointer, which is what breaks the cycle between member and
//! team keys.
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::keyset::{KeyScope, Keyset, KeysetAddress};
use crate::lockbox::Lockbox;

/// All keysets (with secrets) reachable by one principal, every known
/// generation retained for opening historic material.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Keyring {
    keysets: HashMap<(KeyScope, String), BTreeMap<u32, Keyset>>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_keysets(keysets: impl IntoIterator<Item = Keyset>) -> Self {
        let mut keyring = Self::new();
        for keyset in keysets {
            keyring.insert(keyset);
        }
        keyring
    }

    /// Insert a keyset, ignoring an already-known generation.
    pub fn insert(&mut self, keyset: Keyset) {
        self.keysets
            .entry((keyset.scope, keyset.name.clone()))
            .or_default()
            .entry(keyset.generation)
            .or_insert(keyset);
    }

    /// Latest generation of the keyset for `(scope, name)`.
    pub fn get(&self, scope: KeyScope, name: &str) -> Result<&Keyset, KeyringError> {
        self.keysets
            .get(&(scope, name.to_string()))
            .and_then(|generations| generations.values().next_back())
            .ok_or_else(|| KeyringError::NotFound(scope, name.to_string()))
    }

    /// Keyset at an exact generation.
    pub fn get_at(&self, address: &KeysetAddress) -> Result<&Keyset, KeyringError> {
        self.keysets
            .get(&(address.scope, address.name.clone()))
            .and_then(|generations| generations.get(&address.generation))
            .ok_or_else(|| KeyringError::NotFound(address.scope, address.name.clone()))
    }

    pub fn has(&self, scope: KeyScope, name: &str) -> bool {
        self.keysets.contains_key(&(scope, name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.keysets.values().map(|generations| generations.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.keysets.is_empty()
    }

    pub fn keysets(&self) -> impl Iterator<Item = &Keyset> {
        self.keysets.values().flat_map(|generations| generations.values())
    }

    /// Open every lockbox reachable from the current keyring, iterating to
    /// fixpoint. Returns the number of keysets learned.
    pub fn collect(&mut self, lockboxes: &[Lockbox]) -> usize {
        let mut learned = 0;
        loop {
            let mut progressed = false;
            for lockbox in lockboxes {
                if self.get_at(&lockbox.contents.address).is_ok() {
                    continue;
                }
                let Ok(recipient) = self.get_at(&lockbox.recipient.address) else {
                    continue;
                };
                match lockbox.open(&recipient.encryption) {
                    Ok(keyset) => {
                        self.insert(keyset);
                        learned += 1;
                        progressed = true;
                    }
                    Err(err) => {
                        debug!(recipient = %lockbox.recipient.address, "skipping unopenable lockbox: {err}");
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        learned
    }
}

impl Serialize for Keyring {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut sorted: Vec<&Keyset> = self.keysets().collect();
        sorted.sort_by_key(|keyset| keyset.address());

        let mut seq = serializer.serialize_seq(Some(sorted.len()))?;
        for keyset in sorted {
            seq.serialize_element(keyset)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Keyring {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct KeysetListVisitor;

        impl<'de> Visitor<'de> for KeysetListVisitor {
            type Value = Vec<Keyset>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("list of keysets")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut result = Vec::new();
                while let Some(keyset) = seq.next_element()? {
                    result.push(keyset);
                }
                Ok(result)
            }
        }

        let keysets = deserializer.deserialize_seq(KeysetListVisitor)?;
        Ok(Keyring::from_keysets(keysets))
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum KeyringError {
    #[error("no keyset for {0}/{1} is reachable from this keyring")]
    NotFound(KeyScope, String),
}

#[cfg(test)]
mod tests {
    use huddle_crypto::Rng;

    use crate::keyset::{KeyScope, Keyset};
    use crate::lockbox::Lockbox;

    use super::{Keyring, KeyringError};

    #[test]
    fn collects_transitively_to_fixpoint() {
        let rng = Rng::from_seed([1; 32]);

        let device_keys = Keyset::generate(KeyScope::Device, "d1", &rng).unwrap();
        let member_keys = Keyset::generate(KeyScope::Member, "alice", &rng).unwrap();
        let team_keys = Keyset::generate(KeyScope::Team, "t", &rng).unwrap();
        let admin_keys = Keyset::generate(KeyScope::Role, "admin", &rng).unwrap();

        // member -> device, team -> member, admin -> member: the chain must
        // resolve regardless of lockbox order.
        let lockboxes = vec![
            Lockbox::seal(&admin_keys, &member_keys.public(), &rng).unwrap(),
            Lockbox::seal(&team_keys, &member_keys.public(), &rng).unwrap(),
            Lockbox::seal(&member_keys, &device_keys.public(), &rng).unwrap(),
        ];

        let mut keyring = Keyring::from_keysets([device_keys]);
        let learned = keyring.collect(&lockboxes);

        assert_eq!(learned, 3);
        assert!(keyring.get(KeyScope::Team, "t").is_ok());
        assert!(keyring.get(KeyScope::Role, "admin").is_ok());
        assert!(keyring.get(KeyScope::Member, "alice").is_ok());
    }

    #[test]
    fn unreachable_keysets_stay_out() {
        let rng = Rng::from_seed([1; 32]);

        let device_keys = Keyset::generate(KeyScope::Device, "d1", &rng).unwrap();
        let other_member = Keyset::generate(KeyScope::Member, "bob", &rng).unwrap();
        let team_keys = Keyset::generate(KeyScope::Team, "t", &rng).unwrap();

        // Team keys are sealed to Bob only.
        let lockboxes = vec![Lockbox::seal(&team_keys, &other_member.public(), &rng).unwrap()];

        let mut keyring = Keyring::from_keysets([device_keys]);
        keyring.collect(&lockboxes);

        assert_eq!(
            keyring.get(KeyScope::Team, "t"),
            Err(KeyringError::NotFound(KeyScope::Team, "t".to_string()))
        );
    }

    #[test]
    fn latest_generation_wins() {
        let rng = Rng::from_seed([1; 32]);

        let team_keys = Keyset::generate(KeyScope::Team, "t", &rng).unwrap();
        let rotated = team_keys.rotate(&rng).unwrap();

        let mut keyring = Keyring::new();
        keyring.insert(rotated.clone());
        keyring.insert(team_keys.clone());

        assert_eq!(keyring.get(KeyScope::Team, "t").unwrap().generation, 1);
        assert_eq!(keyring.get_at(&team_keys.address()).unwrap().generation, 0);
        assert_eq!(keyring.len(), 2);
    }

    #[test]
    fn serde_round_trip() {
        let rng = Rng::from_seed([1; 32]);

        let mut keyring = Keyring::new();
        keyring.insert(Keyset::generate(KeyScope::Team, "t", &rng).unwrap());
        keyring.insert(Keyset::generate(KeyScope::Member, "alice", &rng).unwrap());

        let bytes = crate::cbor::encode_cbor(&keyring).unwrap();
        let keyring_again: Keyring = crate::cbor::decode_cbor(&bytes).unwrap();

        assert_eq!(keyring_again.len(), 2);
        assert!(keyring_again.get(KeyScope::Team, "t").is_ok());
    }
}
