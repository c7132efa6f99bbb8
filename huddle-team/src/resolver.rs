// SPDX-License-Identifier: MIT OR Apache-2.0

//! The membership resolver.
//!
//! On top of the deterministic branch ordering this resolver filters
//! concurrent branches: a member removed in one branch cannot smuggle
//! writes in through the other. Mutual concurrent removals between two
//! admins resolve by branch order, so the removal carried by the branch
//! that sorts first survives and the other one is dropped along with the
//! rest of the removed admin's writes. Both directions of a merge produce
//! the same output, which keeps `reduce(merge(a, b)) == reduce(merge(b, a))`.
use std::collections::HashSet;

use huddle_core::graph::{order_branches, Graph, Resolver};
use huddle_crypto::Hash;

use crate::action::TeamAction;

#[derive(Debug, Clone, Copy, Default)]
pub struct MembershipResolver;

impl Resolver<TeamAction> for MembershipResolver {
    fn resolve(
        &self,
        graph: &Graph<TeamAction>,
        branch_a: Vec<Hash>,
        branch_b: Vec<Hash>,
    ) -> Vec<Hash> {
        let (first, second) = order_branches(graph, branch_a, branch_b);

        // Members removed in the first branch lose their concurrent writes
        // in the second, including any removal they authored there.
        let removed_in_first = removed_members(graph, &first);
        let second: Vec<Hash> = second
            .into_iter()
            .filter(|hash| !authored_by_any(graph, hash, &removed_in_first))
            .collect();

        // Whatever removals survive in the second branch then drop writes
        // from the first.
        let removed_in_second = removed_members(graph, &second);
        let first: Vec<Hash> = first
            .into_iter()
            .filter(|hash| !authored_by_any(graph, hash, &removed_in_second))
            .collect();

        let mut merged = first;
        merged.extend(second);
        merged
    }
}

/// User names targeted by `REMOVE_MEMBER` links in the branch.
fn removed_members(graph: &Graph<TeamAction>, branch: &[Hash]) -> HashSet<String> {
    branch
        .iter()
        .filter_map(|hash| graph.get(hash)?.as_signed())
        .filter_map(|link| match &link.body.payload {
            TeamAction::RemoveMember { user_name, .. } => Some(user_name.clone()),
            _ => None,
        })
        .collect()
}

fn authored_by_any(graph: &Graph<TeamAction>, hash: &Hash, users: &HashSet<String>) -> bool {
    if users.is_empty() {
        return false;
    }
    graph
        .get(hash)
        .and_then(|link| link.as_signed())
        .map(|link| users.contains(&link.body.author.user_name))
        .unwrap_or(false)
}
