// SPDX-License-Identifier: MIT OR Apache-2.0

//! Summary/delta computation for graph synchronization.
//!
//! One peer announces everything it knows as a hash set; the other answers
//! with the links absent from that set. Two half-rounds converge for any
//! pair of views sharing a root.
use std::collections::{BTreeMap, HashSet};

use huddle_core::graph::{Graph, GraphError, Link};
use huddle_crypto::Hash;
use huddle_team::TeamAction;

/// Every link hash the local graph holds.
pub fn known_hashes(graph: &Graph<TeamAction>) -> Vec<Hash> {
    graph.links().map(|(hash, _)| *hash).collect()
}

/// Links the peer lacks, given the hash set from its summary.
pub fn missing_links(graph: &Graph<TeamAction>, known: &[Hash]) -> Vec<Link<TeamAction>> {
    let known: HashSet<&Hash> = known.iter().collect();
    graph
        .links()
        .filter(|(hash, _)| !known.contains(hash))
        .map(|(_, link)| link.clone())
        .collect()
}

/// Rebuild the peer's view from its head and the links it sent, drawing
/// everything else from the local graph. Only links reachable from the
/// remote head make it in, so local-only branches do not trip validation.
pub fn assemble_remote(
    local: &Graph<TeamAction>,
    remote_head: Hash,
    received: Vec<Link<TeamAction>>,
) -> Result<Graph<TeamAction>, GraphError> {
    let mut pool: BTreeMap<Hash, Link<TeamAction>> = local
        .links()
        .map(|(hash, link)| (*hash, link.clone()))
        .collect();
    for link in received {
        pool.insert(link.hash(), link);
    }

    let mut links = BTreeMap::new();
    let mut stack = vec![remote_head];
    while let Some(hash) = stack.pop() {
        if links.contains_key(&hash) {
            continue;
        }
        let link = pool
            .get(&hash)
            .ok_or(GraphError::UnknownLink(hash))?
            .clone();
        stack.extend(link.parents());
        links.insert(hash, link);
    }

    Graph::assemble(local.root(), remote_head, links)
}
