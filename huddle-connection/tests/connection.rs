// SPDX-License-Identifier: MIT OR Apache-2.0

//! Two-peer protocol runs over an in-memory transport: mutual
//! authentication, invitation admission, graph convergence and the
//! encrypted channel.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use huddle_connection::{
    Connection, ConnectionError, ConnectionEvent, ConnectionState, DisconnectReason,
    NumberedConnectionMessage,
};
use huddle_core::{device_id, Device, InviteeContext, KeyScope, Keyring, Keyset, LocalUser, MemberContext};
use huddle_crypto::Rng;
use huddle_team::{InvitationType, InviteOptions, Member, Role, Team};

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

/// Shuttle messages between both peers until neither has anything left to
/// say.
fn pump(a: &mut Connection, b: &mut Connection, now: u64) {
    for _ in 0..64 {
        let from_a = a.outgoing();
        let from_b = b.outgoing();
        if from_a.is_empty() && from_b.is_empty() {
            return;
        }
        for message in from_a {
            let _ = b.deliver(message, now);
        }
        for message in from_b {
            let _ = a.deliver(message, now);
        }
    }
    panic!("protocol did not quiesce");
}

fn collect_events(connection: &mut Connection) -> Vec<ConnectionEvent> {
    connection.events()
}

#[test]
fn members_authenticate_and_derive_matching_session_keys() {
    let rng = Rng::from_seed([1; 32]);
    let alice_context = member_context(&rng, "alice", "laptop");
    let bob_context = member_context(&rng, "bob", "phone");

    let mut alice_team = Team::create("t", alice_context, Rng::from_seed([2; 32])).unwrap();
    alice_team.add(public_member(&bob_context), vec![]).unwrap();
    let bob_team = Team::join(
        alice_team.graph().clone(),
        Keyring::new(),
        bob_context,
        Rng::from_seed([3; 32]),
    )
    .unwrap();

    let mut alice = Connection::connect(
        Arc::new(Mutex::new(alice_team)),
        Rng::from_seed([4; 32]),
    );
    let mut bob = Connection::connect(Arc::new(Mutex::new(bob_team)), Rng::from_seed([5; 32]));

    alice.start(0);
    bob.start(0);
    pump(&mut alice, &mut bob, 1);

    assert!(alice.is_connected());
    assert!(bob.is_connected());
    assert_eq!(alice.session_key(), bob.session_key());

    assert!(collect_events(&mut alice).contains(&ConnectionEvent::Connected));
    assert!(collect_events(&mut bob).contains(&ConnectionEvent::Connected));

    // The encrypted channel carries application payloads.
    alice.send_message(b"hello bob").unwrap();
    pump(&mut alice, &mut bob, 2);
    assert!(collect_events(&mut bob)
        .iter()
        .any(|event| matches!(event, ConnectionEvent::Message(payload) if payload == b"hello bob")));
}

#[test]
fn invitee_is_admitted_over_the_wire() {
    let rng = Rng::from_seed([1; 32]);
    let alice_context = member_context(&rng, "alice", "laptop");
    let bob_context = member_context(&rng, "bob", "phone");

    let mut alice_team = Team::create("t", alice_context, Rng::from_seed([2; 32])).unwrap();
    let (seed, _id) = alice_team
        .invite_member(
            "bob",
            InviteOptions {
                seed: Some("abcd-efgh-ijkl-mnop".to_string()),
                max_uses: 1,
                ..InviteOptions::default()
            },
        )
        .unwrap();

    let alice_arc = Arc::new(Mutex::new(alice_team));
    let mut alice = Connection::connect(alice_arc.clone(), Rng::from_seed([4; 32]));
    let mut bob = Connection::connect_invitee(
        InviteeContext {
            user: bob_context.user.clone(),
            device: bob_context.device.clone(),
            invitation_seed: seed,
        },
        InvitationType::Member,
        Rng::from_seed([5; 32]),
    );

    alice.start(0);
    bob.start(0);
    pump(&mut alice, &mut bob, 1);

    assert!(alice.is_connected());
    assert!(bob.is_connected());
    assert_eq!(alice.session_key(), bob.session_key());

    // Bob instantiated team state from the wire and is now a member on
    // both sides.
    let bob_team = bob.team().expect("invitee holds a team after admission");
    {
        let alice_guard = alice_arc.lock().unwrap();
        let bob_guard = bob_team.lock().unwrap();
        assert!(alice_guard.has("bob"));
        assert_eq!(alice_guard.members().len(), 2);
        assert_eq!(bob_guard.state(), alice_guard.state());
        assert_eq!(bob_guard.team_keys().unwrap().generation, 0);
    }
}

#[test]
fn divergent_graphs_converge_during_sync() {
    let rng = Rng::from_seed([1; 32]);
    let alice_context = member_context(&rng, "alice", "laptop");
    let bob_context = member_context(&rng, "bob", "phone");

    let mut alice_team = Team::create("t", alice_context, Rng::from_seed([2; 32])).unwrap();
    alice_team
        .add(public_member(&bob_context), vec!["admin".to_string()])
        .unwrap();
    let mut bob_team = Team::join(
        alice_team.graph().clone(),
        Keyring::new(),
        bob_context,
        Rng::from_seed([3; 32]),
    )
    .unwrap();

    // Divergent writes before the peers ever talk.
    alice_team.add_role(Role::named("manager")).unwrap();
    bob_team.add_role(Role::named("guest")).unwrap();

    let alice_arc = Arc::new(Mutex::new(alice_team));
    let bob_arc = Arc::new(Mutex::new(bob_team));
    let mut alice = Connection::connect(alice_arc.clone(), Rng::from_seed([4; 32]));
    let mut bob = Connection::connect(bob_arc.clone(), Rng::from_seed([5; 32]));

    alice.start(0);
    bob.start(0);
    pump(&mut alice, &mut bob, 1);

    assert!(alice.is_connected());
    assert!(bob.is_connected());

    let alice_guard = alice_arc.lock().unwrap();
    let bob_guard = bob_arc.lock().unwrap();
    assert_eq!(alice_guard.head(), bob_guard.head());
    assert_eq!(alice_guard.state(), bob_guard.state());

    let mut role_names: Vec<&str> = alice_guard
        .roles()
        .iter()
        .map(|role| role.role_name.as_str())
        .collect();
    role_names.sort();
    assert_eq!(role_names, vec!["admin", "guest", "manager"]);

    drop(alice_guard);
    drop(bob_guard);
    assert!(collect_events(&mut alice)
        .iter()
        .any(|event| matches!(event, ConnectionEvent::Updated { .. })));
}

#[test]
fn local_update_triggers_a_sync_round() {
    let rng = Rng::from_seed([1; 32]);
    let alice_context = member_context(&rng, "alice", "laptop");
    let bob_context = member_context(&rng, "bob", "phone");

    let mut alice_team = Team::create("t", alice_context, Rng::from_seed([2; 32])).unwrap();
    alice_team.add(public_member(&bob_context), vec![]).unwrap();
    let bob_team = Team::join(
        alice_team.graph().clone(),
        Keyring::new(),
        bob_context,
        Rng::from_seed([3; 32]),
    )
    .unwrap();

    let alice_arc = Arc::new(Mutex::new(alice_team));
    let bob_arc = Arc::new(Mutex::new(bob_team));
    let mut alice = Connection::connect(alice_arc.clone(), Rng::from_seed([4; 32]));
    let mut bob = Connection::connect(bob_arc.clone(), Rng::from_seed([5; 32]));

    alice.start(0);
    bob.start(0);
    pump(&mut alice, &mut bob, 1);
    assert!(alice.is_connected());

    // A steady-state write propagates through LOCAL_UPDATE + SYNC.
    alice_arc
        .lock()
        .unwrap()
        .add_role(Role::named("late-role"))
        .unwrap();
    alice.local_update().unwrap();
    pump(&mut alice, &mut bob, 2);

    let bob_guard = bob_arc.lock().unwrap();
    assert!(bob_guard.roles().iter().any(|role| role.role_name == "late-role"));
    assert_eq!(bob_guard.head(), alice_arc.lock().unwrap().head());
}

#[test]
fn substates_time_out() {
    let rng = Rng::from_seed([1; 32]);
    let alice_context = member_context(&rng, "alice", "laptop");
    let alice_team = Team::create("t", alice_context, Rng::from_seed([2; 32])).unwrap();

    let mut alice = Connection::connect(
        Arc::new(Mutex::new(alice_team)),
        Rng::from_seed([4; 32]),
    );
    alice.start(0);

    assert!(!alice.check_timeout(29_000));
    assert!(alice.check_timeout(31_000));
    assert_eq!(
        alice.state(),
        &ConnectionState::Disconnected(DisconnectReason::Timeout)
    );

    // A timed-out connection refuses further deliveries.
    let result = alice.deliver(
        NumberedConnectionMessage {
            index: 0,
            message: huddle_connection::ConnectionMessage::RequestIdentity,
        },
        32_000,
    );
    assert!(matches!(result, Err(ConnectionError::Closed)));
}

#[test]
fn out_of_window_messages_are_rejected() {
    let rng = Rng::from_seed([1; 32]);
    let alice_context = member_context(&rng, "alice", "laptop");
    let alice_team = Team::create("t", alice_context, Rng::from_seed([2; 32])).unwrap();

    let mut alice = Connection::connect(
        Arc::new(Mutex::new(alice_team)),
        Rng::from_seed([4; 32]),
    );
    alice.start(0);

    // Slightly ahead: buffered, not an error.
    alice
        .deliver(
            NumberedConnectionMessage {
                index: 2,
                message: huddle_connection::ConnectionMessage::AcceptIdentity,
            },
            1,
        )
        .unwrap();

    // Far ahead: protocol violation and disconnect.
    let result = alice.deliver(
        NumberedConnectionMessage {
            index: 100,
            message: huddle_connection::ConnectionMessage::AcceptIdentity,
        },
        1,
    );
    assert!(matches!(result, Err(ConnectionError::ProtocolViolation(_))));
    assert!(matches!(
        alice.state(),
        ConnectionState::Disconnected(DisconnectReason::Error(_))
    ));
}

#[test]
fn stop_is_synchronous_and_idempotent() {
    let rng = Rng::from_seed([1; 32]);
    let alice_context = member_context(&rng, "alice", "laptop");
    let alice_team = Team::create("t", alice_context, Rng::from_seed([2; 32])).unwrap();

    let mut alice = Connection::connect(
        Arc::new(Mutex::new(alice_team)),
        Rng::from_seed([4; 32]),
    );
    alice.start(0);
    alice.stop();
    alice.stop();

    assert_eq!(
        alice.state(),
        &ConnectionState::Disconnected(DisconnectReason::Stopped)
    );
    // Exactly one DISCONNECT went out, followed by nothing.
    let outgoing = alice.outgoing();
    assert_eq!(
        outgoing
            .iter()
            .filter(|envelope| envelope.message.name() == "DISCONNECT")
            .count(),
        1
    );
}
