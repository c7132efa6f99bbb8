// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end team scenarios: founding, invitations, convergence and
//! removal with key rotation.
use std::collections::{BTreeMap, BTreeSet};

use huddle_core::cbor::encode_cbor;
use huddle_core::{device_id, Device, KeyScope, Keyring, Keyset, LocalUser, MemberContext};
use huddle_crypto::Rng;
use huddle_team::invitation::{accept, InvitationError, ProofPayload};
use huddle_team::{InviteOptions, Member, Role, Team, TeamError};

fn member_context(rng: &Rng, user_name: &str, device_name: &str) -> MemberContext {
    let id = device_id(user_name, device_name);
    MemberContext {
        user: LocalUser {
            user_name: user_name.to_string(),
            keys: Keyset::generate(KeyScope::Member, user_name, rng).unwrap(),
        },
        device: Device {
            user_id: user_name.to_string(),
            device_name: device_name.to_string(),
            keys: Keyset::generate(KeyScope::Device, &id, rng).unwrap(),
        },
    }
}

fn public_member(context: &MemberContext) -> Member {
    Member {
        user_name: context.user.user_name.clone(),
        keys: context.user.keys.public(),
        roles: BTreeSet::new(),
        devices: BTreeMap::from([(context.device.device_id(), context.device.public())]),
    }
}

#[test]
fn found_invite_admit() {
    let rng = Rng::from_seed([1; 32]);
    let alice_context = member_context(&rng, "alice", "laptop");
    let bob_context = member_context(&rng, "bob", "phone");

    let mut alice =
        Team::create_from_seed("t", alice_context, "a-seed", Rng::from_seed([2; 32])).unwrap();
    assert_eq!(alice.members().len(), 1);

    let (seed, _id) = alice
        .invite_member(
            "bob",
            InviteOptions {
                seed: Some("abcd-efgh-ijkl-mnop".to_string()),
                max_uses: 1,
                ..InviteOptions::default()
            },
        )
        .unwrap();
    assert_eq!(seed, "abcd-efgh-ijkl-mnop");

    // Bob accepts out of band with the shared seed.
    let proof = accept(&seed, ProofPayload::Member(public_member(&bob_context))).unwrap();
    alice.admit(proof).unwrap();

    assert_eq!(alice.members().len(), 2);
    assert!(alice.has("bob"));
    assert!(!alice.member_is_admin("bob"));

    // Bob instantiates his copy from Alice's graph; the admission lockboxes
    // give him the team keys at generation 0.
    let bob = Team::join(
        alice.graph().clone(),
        Keyring::new(),
        bob_context,
        Rng::from_seed([3; 32]),
    )
    .unwrap();
    assert_eq!(bob.team_keys().unwrap().generation, 0);
    assert_eq!(bob.state(), alice.state());
}

#[test]
fn concurrent_role_additions_converge() {
    let rng = Rng::from_seed([1; 32]);
    let alice_context = member_context(&rng, "alice", "laptop");
    let bob_context = member_context(&rng, "bob", "phone");

    let mut alice = Team::create("t", alice_context, Rng::from_seed([2; 32])).unwrap();
    alice
        .add(public_member(&bob_context), vec!["admin".to_string()])
        .unwrap();

    let mut bob = Team::join(
        alice.graph().clone(),
        Keyring::new(),
        bob_context,
        Rng::from_seed([3; 32]),
    )
    .unwrap();

    // Divergent writes on both forks.
    alice.add_role(Role::named("manager")).unwrap();
    bob.add_role(Role::named("guest")).unwrap();

    // Merge in both directions.
    alice.merge_graph(bob.graph()).unwrap();
    bob.merge_graph(alice.graph()).unwrap();

    let mut role_names: Vec<&str> = alice
        .roles()
        .iter()
        .map(|role| role.role_name.as_str())
        .collect();
    role_names.sort();
    assert_eq!(role_names, vec!["admin", "guest", "manager"]);

    assert_eq!(alice.state(), bob.state());
    // Convergence is bit-for-bit.
    assert_eq!(
        encode_cbor(alice.state()).unwrap(),
        encode_cbor(bob.state()).unwrap()
    );
}

#[test]
fn merge_is_commutative() {
    let rng = Rng::from_seed([1; 32]);
    let alice_context = member_context(&rng, "alice", "laptop");
    let bob_context = member_context(&rng, "bob", "phone");

    let mut alice = Team::create("t", alice_context, Rng::from_seed([2; 32])).unwrap();
    alice
        .add(public_member(&bob_context), vec!["admin".to_string()])
        .unwrap();
    let mut bob = Team::join(
        alice.graph().clone(),
        Keyring::new(),
        bob_context,
        Rng::from_seed([3; 32]),
    )
    .unwrap();

    alice.add_role(Role::named("manager")).unwrap();
    bob.add_role(Role::named("guest")).unwrap();

    // reduce(merge(a, b)) == reduce(merge(b, a))
    let mut graph_ab = alice.graph().clone();
    graph_ab.merge(bob.graph()).unwrap();
    let mut graph_ba = bob.graph().clone();
    graph_ba.merge(alice.graph()).unwrap();

    let state_ab = huddle_team::reduce(&graph_ab, &huddle_team::MembershipResolver).unwrap();
    let state_ba = huddle_team::reduce(&graph_ba, &huddle_team::MembershipResolver).unwrap();
    assert_eq!(state_ab, state_ba);
}

#[test]
fn remove_and_rotate() {
    let rng = Rng::from_seed([1; 32]);
    let alice_context = member_context(&rng, "alice", "laptop");
    let bob_context = member_context(&rng, "bob", "phone");

    let mut alice = Team::create("t", alice_context, Rng::from_seed([2; 32])).unwrap();
    alice
        .add(public_member(&bob_context), vec!["admin".to_string()])
        .unwrap();

    let bob = Team::join(
        alice.graph().clone(),
        Keyring::new(),
        bob_context,
        Rng::from_seed([3; 32]),
    )
    .unwrap();
    // Freeze Bob's keyring as of the moment before his removal.
    let frozen = bob.keyring().clone();
    assert_eq!(frozen.get(KeyScope::Team, "t").unwrap().generation, 0);

    alice.remove("bob").unwrap();

    assert!(!alice.has("bob"));
    assert_eq!(alice.team_keys().unwrap().generation, 1);
    assert_eq!(alice.admin_keys().unwrap().generation, 1);

    // Bob's frozen keyring opens nothing posted after the removal: every
    // generation-1 lockbox is sealed past him.
    let mut stale = frozen.clone();
    stale.collect(&alice.state().lockboxes);
    assert_eq!(stale.get(KeyScope::Team, "t").unwrap().generation, 0);
    assert_eq!(
        stale.get(KeyScope::Role, "admin").unwrap().generation,
        0
    );

    // Alice herself holds the rotated keys.
    assert_eq!(
        alice.keyring().get(KeyScope::Team, "t").unwrap().generation,
        1
    );
}

#[test]
fn forged_invitation_is_rejected() {
    let rng = Rng::from_seed([1; 32]);
    let alice_context = member_context(&rng, "alice", "laptop");
    let eve_context = member_context(&rng, "eve", "burner");

    let mut alice = Team::create("t", alice_context, Rng::from_seed([2; 32])).unwrap();
    let (seed, _id) = alice
        .invite_member(
            "bob",
            InviteOptions {
                seed: Some("s".to_string()),
                max_uses: 1,
                ..InviteOptions::default()
            },
        )
        .unwrap();

    // Eve intercepted the seed and swaps in her own principal.
    let eve_proof = accept(&seed, ProofPayload::Member(public_member(&eve_context))).unwrap();

    assert!(matches!(
        alice.admit(eve_proof),
        Err(TeamError::Invitation(InvitationError::NameMismatch { .. }))
    ));
    assert!(!alice.has("eve"));
}

#[test]
fn invitation_cannot_be_used_twice() {
    let rng = Rng::from_seed([1; 32]);
    let alice_context = member_context(&rng, "alice", "laptop");
    let bob_context = member_context(&rng, "bob", "phone");

    let mut alice = Team::create("t", alice_context, Rng::from_seed([2; 32])).unwrap();
    let (seed, _id) = alice
        .invite_member(
            "bob",
            InviteOptions {
                seed: Some("abcd-efgh".to_string()),
                max_uses: 1,
                ..InviteOptions::default()
            },
        )
        .unwrap();

    let proof = accept(&seed, ProofPayload::Member(public_member(&bob_context))).unwrap();
    alice.admit(proof.clone()).unwrap();
    assert!(alice.has("bob"));

    assert!(matches!(
        alice.admit(proof),
        Err(TeamError::Invitation(InvitationError::Used(_)))
    ));
}

#[test]
fn revoked_invitation_is_rejected() {
    let rng = Rng::from_seed([1; 32]);
    let alice_context = member_context(&rng, "alice", "laptop");
    let bob_context = member_context(&rng, "bob", "phone");

    let mut alice = Team::create("t", alice_context, Rng::from_seed([2; 32])).unwrap();
    let (seed, id) = alice
        .invite_member(
            "bob",
            InviteOptions {
                seed: Some("abcd-efgh".to_string()),
                max_uses: 1,
                ..InviteOptions::default()
            },
        )
        .unwrap();
    alice.revoke_invitation(id).unwrap();

    let proof = accept(&seed, ProofPayload::Member(public_member(&bob_context))).unwrap();
    assert!(matches!(
        alice.admit(proof),
        Err(TeamError::Invitation(InvitationError::Revoked(_)))
    ));
}

#[test]
fn concurrent_remove_beats_writes() {
    let rng = Rng::from_seed([1; 32]);
    let alice_context = member_context(&rng, "alice", "laptop");
    let carol_context = member_context(&rng, "carol", "tablet");

    let mut alice = Team::create("t", alice_context, Rng::from_seed([2; 32])).unwrap();
    alice
        .add(public_member(&carol_context), vec!["admin".to_string()])
        .unwrap();

    let mut carol = Team::join(
        alice.graph().clone(),
        Keyring::new(),
        carol_context,
        Rng::from_seed([3; 32]),
    )
    .unwrap();

    // Alice removes Carol; concurrently Carol adds a role on her fork.
    alice.remove("carol").unwrap();
    carol.add_role(Role::named("sneaky")).unwrap();

    alice.merge_graph(carol.graph()).unwrap();

    assert!(!alice.has("carol"));
    assert!(alice
        .roles()
        .iter()
        .all(|role| role.role_name != "sneaky"));

    // The other merge order lands on the same state.
    let mut graph_ba = carol.graph().clone();
    graph_ba.merge(alice.graph()).unwrap();
    let state_ba = huddle_team::reduce(&graph_ba, &huddle_team::MembershipResolver).unwrap();
    assert_eq!(&state_ba, alice.state());
}

#[test]
fn reduce_equals_replaying_the_sequence() {
    let rng = Rng::from_seed([1; 32]);
    let alice_context = member_context(&rng, "alice", "laptop");
    let bob_context = member_context(&rng, "bob", "phone");

    let mut alice = Team::create("t", alice_context, Rng::from_seed([2; 32])).unwrap();
    alice.add(public_member(&bob_context), vec![]).unwrap();
    alice.add_role(Role::named("manager")).unwrap();
    alice.add_member_role("bob", "manager").unwrap();

    let reduced = huddle_team::reduce(alice.graph(), &huddle_team::MembershipResolver).unwrap();

    // Folding link by link over the linearized graph lands on the same
    // state.
    let ordered =
        huddle_core::graph::sequence(alice.graph(), &huddle_team::MembershipResolver).unwrap();
    let mut replayed = None;
    for hash in ordered {
        let link = alice.graph().get(&hash).unwrap().as_signed().unwrap();
        replayed = Some(huddle_team::apply(replayed, link).unwrap());
    }

    assert_eq!(replayed.as_ref(), Some(&reduced));
    assert_eq!(&reduced, alice.state());
}

#[test]
fn save_load_round_trip() {
    let rng = Rng::from_seed([1; 32]);
    let alice_context = member_context(&rng, "alice", "laptop");

    let mut alice = Team::create("t", alice_context.clone(), Rng::from_seed([2; 32])).unwrap();
    alice.add_role(Role::named("manager")).unwrap();

    let blob = alice.save().unwrap();
    let restored = Team::load(&blob, alice_context, Rng::from_seed([4; 32])).unwrap();

    assert_eq!(restored.state(), alice.state());
    assert_eq!(restored.head(), alice.head());
    assert_eq!(restored.team_keys().unwrap().generation, 0);
    assert!(restored.keyring().get(KeyScope::Role, "manager").is_ok());
}

#[test]
fn keyring_holds_exactly_the_reachable_scopes() {
    let rng = Rng::from_seed([1; 32]);
    let alice_context = member_context(&rng, "alice", "laptop");
    let bob_context = member_context(&rng, "bob", "phone");

    let mut alice = Team::create("t", alice_context, Rng::from_seed([2; 32])).unwrap();
    alice.add_role(Role::named("manager")).unwrap();
    // Bob joins without any roles.
    alice.add(public_member(&bob_context), vec![]).unwrap();

    let bob = Team::join(
        alice.graph().clone(),
        Keyring::new(),
        bob_context,
        Rng::from_seed([3; 32]),
    )
    .unwrap();

    // Team keys and his own keys, nothing more.
    assert!(bob.team_keys().is_ok());
    assert!(bob.keyring().get(KeyScope::Member, "bob").is_ok());
    assert!(bob.keyring().get(KeyScope::Role, "admin").is_err());
    assert!(bob.keyring().get(KeyScope::Role, "manager").is_err());
}

#[test]
fn envelopes_encrypt_and_sign() {
    let rng = Rng::from_seed([1; 32]);
    let alice_context = member_context(&rng, "alice", "laptop");
    let bob_context = member_context(&rng, "bob", "phone");

    let mut alice = Team::create("t", alice_context, Rng::from_seed([2; 32])).unwrap();
    alice.add(public_member(&bob_context), vec![]).unwrap();

    let bob = Team::join(
        alice.graph().clone(),
        Keyring::new(),
        bob_context,
        Rng::from_seed([3; 32]),
    )
    .unwrap();

    // Team-scoped envelope travels between members.
    let envelope = alice.encrypt(b"meeting at noon", None).unwrap();
    assert_eq!(bob.decrypt(&envelope).unwrap(), b"meeting at noon");

    // Admin-scoped envelope stays unreadable for Bob.
    let secret = alice.encrypt(b"admins only", Some("admin")).unwrap();
    assert!(bob.decrypt(&secret).is_err());

    // Signature envelopes verify against enrolled devices only.
    let signed = alice.sign(b"for the record");
    assert!(bob.verify(&signed).is_ok());

    let mut tampered = signed.clone();
    tampered.payload = b"for the broken record".to_vec();
    assert!(matches!(
        bob.verify(&tampered),
        Err(TeamError::InvalidSignature)
    ));
}

#[test]
fn updated_event_fires_on_every_head_change() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let rng = Rng::from_seed([1; 32]);
    let alice_context = member_context(&rng, "alice", "laptop");

    let mut alice = Team::create("t", alice_context, Rng::from_seed([2; 32])).unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    alice.subscribe(move |_event| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    alice.add_role(Role::named("manager")).unwrap();
    alice.add_role(Role::named("guest")).unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}
