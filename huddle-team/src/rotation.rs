// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scope rotation after removal of a principal.
//!
//! When a principal with scope S is removed, S and every scope a holder of
//! S could transitively read must move to a new generation, and every
//! remaining holder gets a fresh lockbox. Reachability runs over the
//! lockbox graph restricted to current generations: an edge leads from a
//! recipient scope to the contents scope it unlocks.
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use huddle_core::{
    KeyScope, Keyring, KeyringError, Keyset, KeysetError, Lockbox, LockboxError, PublicKeyset,
};
use huddle_crypto::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::state::TeamState;

/// A scope identified without a generation.
pub type ScopeKey = (KeyScope, String);

/// All scopes compromised by the loss of `seed`, including `seed` itself.
pub fn scopes_to_rotate(state: &TeamState, seed: &ScopeKey) -> BTreeSet<ScopeKey> {
    let mut reachable: BTreeSet<ScopeKey> = BTreeSet::from([seed.clone()]);
    let mut queue: VecDeque<ScopeKey> = VecDeque::from([seed.clone()]);

    while let Some((scope, name)) = queue.pop_front() {
        for lockbox in &state.lockboxes {
            let recipient = &lockbox.recipient.address;
            if recipient.scope != scope || recipient.name != name {
                continue;
            }
            let contents = &lockbox.contents.address;
            if contents.generation
                != state.current_generation(contents.scope, &contents.name)
            {
                continue;
            }
            let key = (contents.scope, contents.name.clone());
            if reachable.insert(key.clone()) {
                queue.push_back(key);
            }
        }
    }

    reachable
}

/// Principals currently holding the keys of `(scope, name)`: the distinct
/// recipients of its current-generation lockboxes.
pub fn holders(state: &TeamState, scope: KeyScope, name: &str) -> BTreeSet<ScopeKey> {
    state
        .current_lockboxes(scope, name)
        .map(|lockbox| {
            (
                lockbox.recipient.address.scope,
                lockbox.recipient.address.name.clone(),
            )
        })
        .collect()
}

/// New keysets and the lockboxes re-distributing them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RotationPlan {
    pub keysets: Vec<Keyset>,
    pub lockboxes: Vec<Lockbox>,
}

/// Plan the rotation caused by removing `seed`, excluding the removed
/// principals from receiving new lockboxes.
///
/// Scopes whose every holder is excluded (the removed member's own member
/// scope, for instance) are skipped: nobody is left to hold a replacement.
pub fn plan_rotation(
    state: &TeamState,
    keyring: &Keyring,
    seed: &ScopeKey,
    excluded: &[ScopeKey],
    rng: &Rng,
) -> Result<RotationPlan, RotationError> {
    let scopes = scopes_to_rotate(state, seed);

    let mut replacements: BTreeMap<ScopeKey, Keyset> = BTreeMap::new();
    for (scope, name) in &scopes {
        let remaining: BTreeSet<ScopeKey> = holders(state, *scope, name)
            .into_iter()
            .filter(|holder| !excluded.contains(holder))
            .collect();
        if remaining.is_empty() {
            debug!(scope = %scope, name = %name, "skipping rotation, no remaining holders");
            continue;
        }
        let current = keyring.get(*scope, name)?;
        replacements.insert((*scope, name.clone()), current.rotate(rng)?);
    }

    let mut lockboxes = Vec::new();
    for ((scope, name), replacement) in &replacements {
        for holder in holders(state, *scope, name) {
            if excluded.contains(&holder) {
                continue;
            }
            // A holder that was itself rotated receives the lockbox at its
            // replacement keyset.
            let recipient = match replacements.get(&holder) {
                Some(rotated) => rotated.public(),
                None => recipient_public(state, &holder)
                    .ok_or_else(|| RotationError::UnknownRecipient(holder.0, holder.1.clone()))?,
            };
            lockboxes.push(Lockbox::seal(replacement, &recipient, rng)?);
        }
    }

    Ok(RotationPlan {
        keysets: replacements.into_values().collect(),
        lockboxes,
    })
}

/// Current public keyset of a principal, as far as team state knows it.
pub(crate) fn recipient_public(state: &TeamState, (scope, name): &ScopeKey) -> Option<PublicKeyset> {
    let base = match scope {
        KeyScope::Member => state.member(name).map(|member| member.keys.clone()),
        KeyScope::Device => state.device(name).map(|(_, device)| device.keys.clone()),
        KeyScope::Server => state.servers.get(name).map(|server| server.keys.clone()),
        _ => None,
    }?;

    // Lockbox contents may carry a newer encryption key than the record.
    match state.encryption_key(*scope, name) {
        Some((generation, encryption)) if generation > base.generation => Some(PublicKeyset {
            generation,
            encryption,
            ..base
        }),
        _ => Some(base),
    }
}

#[derive(Debug, Error)]
pub enum RotationError {
    #[error(transparent)]
    Keyring(#[from] KeyringError),

    #[error(transparent)]
    Keyset(#[from] KeysetError),

    #[error(transparent)]
    Lockbox(#[from] LockboxError),

    #[error("no public keys known for rotation recipient {0}/{1}")]
    UnknownRecipient(KeyScope, String),
}
