// SPDX-License-Identifier: MIT OR Apache-2.0

//! The hash-linked signature graph.
//!
//! An append-only DAG of signed links with exactly one root and, per local
//! view, exactly one head. Merging two views with the same root unions their
//! links and joins the heads with an unsigned merge link. The graph carries
//! no team semantics of its own; payloads are opaque here and interpreted by
//! the reducer on top.
use std::collections::{BTreeMap, HashSet};

use huddle_crypto::ed25519::SigningKey;
use huddle_crypto::Hash;
use petgraph::prelude::DiGraphMap;
use petgraph::visit::{Dfs, Reversed};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod link;
mod sequence;

pub use link::{Link, LinkAuthor, LinkBody, MergeLink, SignedLink};
pub use sequence::{sequence, sequence_range, order_branches, Resolver, TrivialResolver};

/// Hash-linked DAG of signed links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "A: Serialize", deserialize = "A: DeserializeOwned"))]
pub struct Graph<A> {
    root: Hash,
    head: Hash,
    links: BTreeMap<Hash, Link<A>>,
}

impl<A> Graph<A>
where
    A: Clone + Serialize + DeserializeOwned,
{
    /// Mint a root link and the graph around it.
    pub fn create(
        payload: A,
        author: LinkAuthor,
        timestamp: u64,
        key: &SigningKey,
    ) -> Self {
        let link = LinkBody {
            prev: None,
            payload,
            timestamp,
            author,
        }
        .sign(key);
        let hash = link.hash();

        let mut links = BTreeMap::new();
        links.insert(hash, Link::Signed(link));

        Self {
            root: hash,
            head: hash,
            links,
        }
    }

    /// Append a signed link on top of the current head.
    pub fn append(
        &mut self,
        payload: A,
        author: LinkAuthor,
        timestamp: u64,
        key: &SigningKey,
    ) -> Hash {
        let link = LinkBody {
            prev: Some(self.head),
            payload,
            timestamp,
            author,
        }
        .sign(key);
        let hash = link.hash();

        self.links.insert(hash, Link::Signed(link));
        self.head = hash;
        hash
    }

    /// Union another view of the same graph into this one.
    ///
    /// If one head already contains the other the merge fast-forwards,
    /// otherwise a merge link joining both heads becomes the new head.
    pub fn merge(&mut self, other: &Graph<A>) -> Result<Hash, GraphError> {
        if self.root != other.root {
            return Err(GraphError::DifferentRoots(self.root, other.root));
        }

        for (hash, link) in &other.links {
            self.links.entry(*hash).or_insert_with(|| link.clone());
        }

        if self.head == other.head || self.is_predecessor(other.head, self.head) {
            return Ok(self.head);
        }
        if self.is_predecessor(self.head, other.head) {
            self.head = other.head;
            return Ok(self.head);
        }

        let merge = MergeLink::new(self.head, other.head);
        let hash = merge.hash();
        self.links.insert(hash, Link::Merge(merge));
        self.head = hash;
        Ok(hash)
    }

    /// Reassemble a graph from loose links, e.g. a peer's view received
    /// during sync. The set must pass structural validation.
    pub fn assemble(
        root: Hash,
        head: Hash,
        links: BTreeMap<Hash, Link<A>>,
    ) -> Result<Self, GraphError> {
        let graph = Self { root, head, links };
        graph.validate()?;
        Ok(graph)
    }

    pub fn root(&self) -> Hash {
        self.root
    }

    pub fn head(&self) -> Hash {
        self.head
    }

    pub fn get(&self, hash: &Hash) -> Option<&Link<A>> {
        self.links.get(hash)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.links.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn links(&self) -> impl Iterator<Item = (&Hash, &Link<A>)> {
        self.links.iter()
    }

    /// Canonical payload bytes of a signed link, used for deterministic
    /// branch ordering.
    pub(crate) fn payload_bytes(&self, hash: &Hash) -> Option<Vec<u8>> {
        let link = self.links.get(hash)?.as_signed()?;
        Some(
            crate::cbor::encode_cbor(&link.body.payload)
                .expect("CBOR encoder failed on link payload"),
        )
    }

    /// Edges parent -> child over every known link.
    fn digraph(&self) -> DiGraphMap<Hash, ()> {
        let mut graph = DiGraphMap::new();
        for (hash, link) in &self.links {
            graph.add_node(*hash);
            for parent in link.parents() {
                graph.add_edge(parent, *hash, ());
            }
        }
        graph
    }

    /// Direct parents of a link.
    pub fn predecessors(&self, hash: &Hash) -> Vec<Hash> {
        self.links
            .get(hash)
            .map(|link| link.parents())
            .unwrap_or_default()
    }

    /// Direct children of a link.
    pub fn successors(&self, hash: &Hash) -> Vec<Hash> {
        self.links
            .iter()
            .filter(|(_, link)| link.parents().contains(hash))
            .map(|(child, _)| *child)
            .collect()
    }

    /// Return `true` if `a` comes strictly before `b`.
    pub fn is_predecessor(&self, a: Hash, b: Hash) -> bool {
        if a == b {
            return false;
        }
        let graph = self.digraph();
        if !graph.contains_node(a) || !graph.contains_node(b) {
            return false;
        }
        let mut dfs = Dfs::new(&graph, a);
        while let Some(node) = dfs.next(&graph) {
            if node == b {
                return true;
            }
        }
        false
    }

    /// All ancestors of `hash`, including `hash` itself.
    fn ancestors(&self, hash: Hash) -> HashSet<Hash> {
        let graph = self.digraph();
        let mut ancestors = HashSet::new();
        if !graph.contains_node(hash) {
            return ancestors;
        }
        let reversed = Reversed(&graph);
        let mut dfs = Dfs::new(&reversed, hash);
        while let Some(node) = dfs.next(&reversed) {
            ancestors.insert(node);
        }
        ancestors
    }

    /// Nearest common predecessor of a set of links.
    ///
    /// The result is the topologically-latest link every input descends
    /// from; when several qualify the highest hash wins, which keeps the
    /// choice identical on every peer.
    pub fn common_predecessor(&self, hashes: &[Hash]) -> Option<Hash> {
        let mut iter = hashes.iter();
        let mut common = self.ancestors(*iter.next()?);
        for hash in iter {
            let ancestors = self.ancestors(*hash);
            common.retain(|candidate| ancestors.contains(candidate));
        }
        // Any input that is itself a common ancestor is not a *predecessor*
        // of the others.
        for hash in hashes {
            common.remove(hash);
        }

        let mut shadowed: HashSet<Hash> = HashSet::new();
        for candidate in &common {
            for ancestor in self.ancestors(*candidate) {
                if ancestor != *candidate {
                    shadowed.insert(ancestor);
                }
            }
        }

        common
            .into_iter()
            .filter(|candidate| !shadowed.contains(candidate))
            .max()
    }

    /// Structural validation: one root, resolvable parents, every link
    /// reachable from the head.
    pub fn validate(&self) -> Result<(), GraphError> {
        let roots: Vec<Hash> = self
            .links
            .iter()
            .filter(|(_, link)| matches!(link, Link::Signed(signed) if signed.is_root()))
            .map(|(hash, _)| *hash)
            .collect();
        if roots != vec![self.root] {
            return Err(GraphError::RootMismatch(roots.len()));
        }

        if !self.links.contains_key(&self.head) {
            return Err(GraphError::UnknownLink(self.head));
        }

        for (hash, link) in &self.links {
            for parent in link.parents() {
                if !self.links.contains_key(&parent) {
                    return Err(GraphError::UnresolvedParent {
                        link: *hash,
                        parent,
                    });
                }
            }
        }

        let reachable = self.ancestors(self.head);
        for hash in self.links.keys() {
            if !reachable.contains(hash) {
                return Err(GraphError::UnreachableLink(*hash));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum GraphError {
    #[error("link {0} is not part of the graph")]
    UnknownLink(Hash),

    #[error("graphs have different roots: {0} and {1}")]
    DifferentRoots(Hash, Hash),

    #[error("expected exactly one root link, found {0}")]
    RootMismatch(usize),

    #[error("link {link} references unresolved parent {parent}")]
    UnresolvedParent { link: Hash, parent: Hash },

    #[error("link {0} is not reachable from the head")]
    UnreachableLink(Hash),

    #[error("{from} does not precede {to} in the graph")]
    InvalidRange { from: Hash, to: Hash },

    #[error("merge link joins branches without a common predecessor")]
    NoCommonPredecessor,
}
