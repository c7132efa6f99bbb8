// SPDX-License-Identifier: MIT OR Apache-2.0

//! Links: the entries of the signature graph.
//!
//! A signed link binds its payload, parent, timestamp and author through a
//! signature over the canonical CBOR bytes of its body. A merge link is
//! unsigned; it is content-addressed by the unordered pair of branch heads
//! it joins.
use huddle_crypto::ed25519::{Signature, SignatureError, SigningKey, VerifyingKey};
use huddle_crypto::{domain_hash, Hash};
use serde::{Deserialize, Serialize};

use crate::cbor::encode_cbor;

const LINK_DOMAIN: &str = "huddle/link";
const MERGE_DOMAIN: &str = "huddle/link/merge";

/// Who authored a signed link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkAuthor {
    pub user_name: String,
    pub device_id: String,
    /// Generation of the device signing key active when the link was written.
    pub generation: u32,
}

/// The signed portion of a link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkBody<A> {
    /// Hash of the previous link; `None` exactly for the root.
    pub prev: Option<Hash>,
    pub payload: A,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub author: LinkAuthor,
}

impl<A> LinkBody<A>
where
    A: Serialize,
{
    pub fn to_bytes(&self) -> Vec<u8> {
        // All link bodies are built from serializable parts; an encoder
        // failure here means a critical IO error.
        encode_cbor(self).expect("CBOR encoder failed on link body")
    }

    pub fn sign(self, key: &SigningKey) -> SignedLink<A> {
        let signature = key.sign(&self.to_bytes());
        SignedLink {
            body: self,
            signature,
        }
    }
}

/// A link with its author's signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedLink<A> {
    pub body: LinkBody<A>,
    pub signature: Signature,
}

impl<A> SignedLink<A>
where
    A: Serialize,
{
    pub fn hash(&self) -> Hash {
        let bytes = encode_cbor(self).expect("CBOR encoder failed on signed link");
        domain_hash(LINK_DOMAIN, bytes)
    }

    pub fn verify(&self, key: &VerifyingKey) -> Result<(), SignatureError> {
        key.verify(&self.body.to_bytes(), &self.signature)
    }

    pub fn is_root(&self) -> bool {
        self.body.prev.is_none()
    }
}

/// An unsigned link joining two concurrent branch heads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeLink {
    branches: [Hash; 2],
}

impl MergeLink {
    /// The pair is unordered; branches are stored hash-sorted so the same
    /// merge is content-addressed identically on every peer.
    pub fn new(a: Hash, b: Hash) -> Self {
        let branches = if a <= b { [a, b] } else { [b, a] };
        Self { branches }
    }

    pub fn branches(&self) -> [Hash; 2] {
        self.branches
    }

    pub fn hash(&self) -> Hash {
        let bytes = encode_cbor(self).expect("CBOR encoder failed on merge link");
        domain_hash(MERGE_DOMAIN, bytes)
    }
}

/// One entry of the signature graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum Link<A> {
    Signed(SignedLink<A>),
    Merge(MergeLink),
}

impl<A> Link<A>
where
    A: Serialize,
{
    pub fn hash(&self) -> Hash {
        match self {
            Link::Signed(link) => link.hash(),
            Link::Merge(merge) => merge.hash(),
        }
    }

    /// Direct parents of this link within the graph.
    pub fn parents(&self) -> Vec<Hash> {
        match self {
            Link::Signed(link) => link.body.prev.into_iter().collect(),
            Link::Merge(merge) => merge.branches().to_vec(),
        }
    }

    pub fn is_merge(&self) -> bool {
        matches!(self, Link::Merge(_))
    }

    pub fn as_signed(&self) -> Option<&SignedLink<A>> {
        match self {
            Link::Signed(link) => Some(link),
            Link::Merge(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use huddle_crypto::ed25519::SigningKey;
    use huddle_crypto::{domain_hash, Rng};

    use super::{LinkAuthor, LinkBody, MergeLink};

    fn author() -> LinkAuthor {
        LinkAuthor {
            user_name: "alice".to_string(),
            device_id: "d1".to_string(),
            generation: 0,
        }
    }

    #[test]
    fn sign_and_verify() {
        let rng = Rng::from_seed([1; 32]);
        let key = SigningKey::from_bytes(rng.random_array().unwrap());

        let link = LinkBody {
            prev: None,
            payload: "payload".to_string(),
            timestamp: 17,
            author: author(),
        }
        .sign(&key);

        assert!(link.verify(&key.verifying_key()).is_ok());
        assert!(link.is_root());

        let other_key = SigningKey::from_bytes(rng.random_array().unwrap());
        assert!(link.verify(&other_key.verifying_key()).is_err());
    }

    #[test]
    fn tampered_body_fails_verification() {
        let rng = Rng::from_seed([1; 32]);
        let key = SigningKey::from_bytes(rng.random_array().unwrap());

        let mut link = LinkBody {
            prev: None,
            payload: "payload".to_string(),
            timestamp: 17,
            author: author(),
        }
        .sign(&key);

        link.body.payload = "tampered".to_string();
        assert!(link.verify(&key.verifying_key()).is_err());
    }

    #[test]
    fn merge_links_are_order_independent() {
        let a = domain_hash("huddle/test", b"a");
        let b = domain_hash("huddle/test", b"b");

        let merge_1 = MergeLink::new(a, b);
        let merge_2 = MergeLink::new(b, a);

        assert_eq!(merge_1, merge_2);
        assert_eq!(merge_1.hash(), merge_2.hash());
    }
}
