// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deterministic topological linearization.
//!
//! Concurrent branches are linearized by a caller-supplied [`Resolver`].
//! Resolvers must be pure functions of their inputs: two peers sequencing
//! the same graph then get bit-for-bit identical orderings, which is what
//! makes the fold over the graph converge everywhere.
use huddle_crypto::{domain_hash, Hash};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Graph, GraphError, Link};

const SORT_DOMAIN: &str = "DETERMINISTIC_SORT";

/// Linearizes two concurrent branches into one sequence.
///
/// Implementations may drop links (e.g. writes by a concurrently-removed
/// member) but must be deterministic on their inputs.
pub trait Resolver<A> {
    fn resolve(&self, graph: &Graph<A>, branch_a: Vec<Hash>, branch_b: Vec<Hash>) -> Vec<Hash>;
}

/// Orders two branches by the domain-tagged hash of their first payload and
/// concatenates them.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrivialResolver;

impl<A> Resolver<A> for TrivialResolver
where
    A: Clone + Serialize + DeserializeOwned,
{
    fn resolve(&self, graph: &Graph<A>, branch_a: Vec<Hash>, branch_b: Vec<Hash>) -> Vec<Hash> {
        let (first, second) = order_branches(graph, branch_a, branch_b);
        let mut merged = first;
        merged.extend(second);
        merged
    }
}

/// Deterministic branch ordering shared by all resolvers: branches sort by
/// `hash(SORT_DOMAIN, first payload)`; an empty branch sorts first.
pub fn order_branches<A>(
    graph: &Graph<A>,
    branch_a: Vec<Hash>,
    branch_b: Vec<Hash>,
) -> (Vec<Hash>, Vec<Hash>)
where
    A: Clone + Serialize + DeserializeOwned,
{
    let sort_key = |branch: &[Hash]| {
        branch
            .first()
            .and_then(|hash| graph.payload_bytes(hash))
            .map(|bytes| domain_hash(SORT_DOMAIN, bytes))
    };

    if sort_key(&branch_a) <= sort_key(&branch_b) {
        (branch_a, branch_b)
    } else {
        (branch_b, branch_a)
    }
}

/// Linearize the whole graph from root to head. Merge links are dropped
/// from the output.
pub fn sequence<A, R>(graph: &Graph<A>, resolver: &R) -> Result<Vec<Hash>, GraphError>
where
    A: Clone + Serialize + DeserializeOwned,
    R: Resolver<A>,
{
    let mut out = vec![graph.root()];
    out.extend(sequence_range(graph, resolver, graph.root(), graph.head())?);
    Ok(out)
}

/// Linearize the links strictly after `from` up to and including `to`.
///
/// Walks backward via `prev`. At a merge link the two branches are
/// sequenced independently from their nearest common predecessor and joined
/// by the resolver; when `from` itself lies past the fork only the branch
/// containing it is followed.
pub fn sequence_range<A, R>(
    graph: &Graph<A>,
    resolver: &R,
    from: Hash,
    to: Hash,
) -> Result<Vec<Hash>, GraphError>
where
    A: Clone + Serialize + DeserializeOwned,
    R: Resolver<A>,
{
    if from == to {
        return Ok(Vec::new());
    }

    match graph.get(&to).ok_or(GraphError::UnknownLink(to))? {
        Link::Signed(link) => {
            let prev = link
                .body
                .prev
                .ok_or(GraphError::InvalidRange { from, to })?;
            let mut out = sequence_range(graph, resolver, from, prev)?;
            out.push(to);
            Ok(out)
        }
        Link::Merge(merge) => {
            let [head_a, head_b] = merge.branches();
            let fork = graph
                .common_predecessor(&[head_a, head_b])
                .ok_or(GraphError::NoCommonPredecessor)?;

            // `from` lies past the fork: it sits on exactly one of the two
            // branches, so only that branch is walked.
            if fork != from && graph.is_predecessor(fork, from) {
                if from == head_a || graph.is_predecessor(from, head_a) {
                    return sequence_range(graph, resolver, from, head_a);
                }
                return sequence_range(graph, resolver, from, head_b);
            }

            let branch_a = sequence_range(graph, resolver, fork, head_a)?;
            let branch_b = sequence_range(graph, resolver, fork, head_b)?;
            let merged = resolver.resolve(graph, branch_a, branch_b);

            let mut out = sequence_range(graph, resolver, from, fork)?;
            out.extend(merged);
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use huddle_crypto::ed25519::SigningKey;
    use huddle_crypto::Rng;

    use crate::graph::{Graph, LinkAuthor};

    use super::{sequence, sequence_range, TrivialResolver};

    fn author(name: &str) -> LinkAuthor {
        LinkAuthor {
            user_name: name.to_string(),
            device_id: format!("{name}-device"),
            generation: 0,
        }
    }

    fn payloads(graph: &Graph<String>, hashes: &[huddle_crypto::Hash]) -> Vec<String> {
        hashes
            .iter()
            .map(|hash| {
                graph
                    .get(hash)
                    .unwrap()
                    .as_signed()
                    .unwrap()
                    .body
                    .payload
                    .clone()
            })
            .collect()
    }

    #[test]
    fn linear_graph_sequences_in_order() {
        let rng = Rng::from_seed([1; 32]);
        let key = SigningKey::from_bytes(rng.random_array().unwrap());

        let mut graph: Graph<String> = Graph::create("a".to_string(), author("alice"), 0, &key);
        graph.append("b".to_string(), author("alice"), 1, &key);
        graph.append("c".to_string(), author("alice"), 2, &key);

        let ordered = sequence(&graph, &TrivialResolver).unwrap();
        assert_eq!(payloads(&graph, &ordered), vec!["a", "b", "c"]);
    }

    #[test]
    fn concurrent_branches_resolve_identically_for_both_merge_orders() {
        let rng = Rng::from_seed([1; 32]);
        let key = SigningKey::from_bytes(rng.random_array().unwrap());

        let base: Graph<String> = Graph::create("root".to_string(), author("alice"), 0, &key);

        let mut fork_a = base.clone();
        fork_a.append("a1".to_string(), author("alice"), 1, &key);
        fork_a.append("a2".to_string(), author("alice"), 2, &key);

        let mut fork_b = base.clone();
        fork_b.append("b1".to_string(), author("bob"), 1, &key);

        let mut merged_ab = fork_a.clone();
        merged_ab.merge(&fork_b).unwrap();
        let mut merged_ba = fork_b.clone();
        merged_ba.merge(&fork_a).unwrap();

        let sequence_ab = sequence(&merged_ab, &TrivialResolver).unwrap();
        let sequence_ba = sequence(&merged_ba, &TrivialResolver).unwrap();

        assert_eq!(sequence_ab, sequence_ba);

        // Branches stay contiguous: a1 is directly followed by a2.
        let ordered = payloads(&merged_ab, &sequence_ab);
        let position = ordered.iter().position(|p| p == "a1").unwrap();
        assert_eq!(ordered[position + 1], "a2");
        assert_eq!(ordered.len(), 4);
        // The merge link itself does not appear.
        assert_eq!(merged_ab.len(), 5);
    }

    #[test]
    fn nested_merges_sequence_every_link_once() {
        let rng = Rng::from_seed([1; 32]);
        let key = SigningKey::from_bytes(rng.random_array().unwrap());

        let base: Graph<String> = Graph::create("root".to_string(), author("alice"), 0, &key);

        let mut fork_a = base.clone();
        fork_a.append("a1".to_string(), author("alice"), 1, &key);
        let mut fork_b = base.clone();
        fork_b.append("b1".to_string(), author("bob"), 1, &key);
        fork_a.merge(&fork_b).unwrap();
        fork_a.append("a2".to_string(), author("alice"), 2, &key);

        let mut fork_c = base.clone();
        fork_c.append("c1".to_string(), author("carol"), 1, &key);
        fork_a.merge(&fork_c).unwrap();

        let ordered = sequence(&fork_a, &TrivialResolver).unwrap();
        let mut named = payloads(&fork_a, &ordered);
        assert_eq!(named.remove(0), "root");
        named.sort();
        assert_eq!(named, vec!["a1", "a2", "b1", "c1"]);
    }

    #[test]
    fn subrange_from_one_branch() {
        let rng = Rng::from_seed([1; 32]);
        let key = SigningKey::from_bytes(rng.random_array().unwrap());

        let base: Graph<String> = Graph::create("root".to_string(), author("alice"), 0, &key);

        let mut fork_a = base.clone();
        let a1 = fork_a.append("a1".to_string(), author("alice"), 1, &key);
        fork_a.append("a2".to_string(), author("alice"), 2, &key);

        let mut fork_b = base.clone();
        fork_b.append("b1".to_string(), author("bob"), 1, &key);

        fork_a.merge(&fork_b).unwrap();

        // Sequencing from a1: the fork precedes it, so only the branch
        // holding a1 is walked.
        let tail = sequence_range(&fork_a, &TrivialResolver, a1, fork_a.head()).unwrap();
        assert_eq!(payloads(&fork_a, &tail), vec!["a2"]);
    }
}
