//! Integration tests for the rendezvous service
//!
//! These drive the room manager the way the WebSocket transport does and
//! check what each session ends up seeing:
//! - Pool matching and the sessions it leaves waiting
//! - Direct joins by code and public search
//! - Presence events on join, leave and disconnect
//! - Signal and chat relay
//! - Room sharing between two instances over an in-process bus

mod fixtures;

use fixtures::{session_ids, test_catalog, TestSystem};
use rendezvous::bus::{BusListener, LocalRoomBus, RoomEventBus};
use rendezvous::error::RendezvousError;
use rendezvous::metrics::MetricsCollector;
use rendezvous::room::{RoomDirectory, RoomManager};
use rendezvous::session::SessionState;
use rendezvous::transport::{parse_command, ConnectionHub, ForwardingSink};
use rendezvous::types::{
    BusMessage, ClientCommand, RoomMutation, ServerEvent, SignalKind, Visibility,
};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

fn room_sizes(system: &TestSystem) -> HashMap<String, usize> {
    let mut sizes = HashMap::new();
    for (_, key) in system.sink.matched_rooms() {
        *sizes.entry(key).or_insert(0) += 1;
    }
    sizes
}

#[tokio::test]
async fn test_pair_pool_leaves_odd_session_waiting() {
    let mut system = TestSystem::new();
    let ids = session_ids(7);
    let ids: Vec<&str> = ids.iter().map(String::as_str).collect();

    system.enqueue_all(&ids, "en", "pair").await;
    assert_eq!(system.run_passes().await, 1, "triggers should coalesce");

    let sizes = room_sizes(&system);
    assert_eq!(sizes.len(), 3);
    assert!(sizes.values().all(|&size| size == 2));

    assert_eq!(system.manager.pools().waiting_in("en"), 1);
    let counts = system.manager.registry().counts();
    assert_eq!(counts.in_room, 6);
    assert_eq!(counts.waiting, 1);

    // One replicated join per matched member
    let joins = system
        .bus
        .published()
        .into_iter()
        .filter(|m| matches!(m, BusMessage::Mutation(RoomMutation::MemberJoined { .. })))
        .count();
    assert_eq!(joins, 6);
}

#[tokio::test]
async fn test_group_pool_respects_bounds() {
    let mut system = TestSystem::new();
    system
        .enqueue_all(&["a", "b", "c", "d", "e"], "en", "squad")
        .await;
    system.run_passes().await;

    let sizes = room_sizes(&system);
    assert_eq!(sizes.len(), 1);
    assert_eq!(sizes.values().next(), Some(&4));
    assert_eq!(system.manager.pools().waiting_in("en"), 1);

    let mut small = TestSystem::new();
    small.enqueue_all(&["x", "y"], "en", "squad").await;
    small.run_passes().await;

    assert!(small.sink.matched_rooms().is_empty());
    assert_eq!(small.manager.pools().waiting_in("en"), 2);
}

#[tokio::test]
async fn test_matched_event_contents() {
    let mut system = TestSystem::new();
    system.enqueue_all(&["ada", "bob"], "en", "pair").await;
    system.run_passes().await;

    match system.sink.events_for("ada").as_slice() {
        [ServerEvent::Matched {
            activity,
            room_key,
            self_id,
            peer_ids,
            peer_names,
            min_players,
        }] => {
            assert_eq!(activity, "pair");
            assert!(room_key.starts_with("en|pair|"));
            assert_eq!(self_id, "ada");
            assert_eq!(peer_ids, &vec!["bob".to_string()]);
            assert_eq!(peer_names.get("bob").map(String::as_str), Some("bob"));
            assert_eq!(peer_names.len(), 2);
            assert_eq!(*min_players, 2);
        }
        other => panic!("expected a single matched event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_pass_is_idempotent_on_unchanged_pool() {
    let mut system = TestSystem::new();
    system.enqueue_all(&["a", "b", "c"], "en", "pair").await;
    system.run_passes().await;
    let matched = system.sink.count_events_of_type("matched");

    system.manager.scheduler().trigger("en");
    system.run_passes().await;

    assert_eq!(system.sink.count_events_of_type("matched"), matched);
    assert_eq!(system.manager.pools().waiting_in("en"), 1);
}

#[tokio::test]
async fn test_disconnected_session_is_never_matched() {
    let mut system = TestSystem::new();
    system.enqueue_all(&["a", "b", "c"], "en", "pair").await;
    system.manager.handle_disconnect("b").await.unwrap();

    system.run_passes().await;

    let matched = system.sink.matched_rooms();
    assert!(matched.iter().all(|(id, _)| id != "b"));
    let members: HashSet<&str> = matched.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(members, HashSet::from(["a", "c"]));
    assert!(!system.manager.registry().contains("b"));
}

#[tokio::test]
async fn test_locales_never_mix() {
    let mut system = TestSystem::new();
    system.enqueue_all(&["en-1"], "en", "pair").await;
    system.enqueue_all(&["fr-1"], "fr", "pair").await;
    system.run_passes().await;

    assert!(system.sink.matched_rooms().is_empty());
    assert_eq!(system.manager.pools().waiting_in("en"), 1);
    assert_eq!(system.manager.pools().waiting_in("fr"), 1);
}

#[tokio::test]
async fn test_media_room_caps_at_two() {
    let system = TestSystem::new();
    system.join_code("a", "CALL42", true).await;
    system.join_code("b", "CALL42", true).await;
    assert_eq!(system.members_of("CALL42"), vec!["a", "b"]);

    system.join_code("c", "CALL42", true).await;

    assert_eq!(system.members_of("CALL42"), vec!["a", "b"]);
    assert_eq!(
        system.sink.events_for("c"),
        vec![ServerEvent::RoomFull {
            room_key: "CALL42".to_string()
        }]
    );
    assert_eq!(
        system.manager.registry().state("c"),
        Some(SessionState::Idle)
    );
    // Existing members hear nothing about the rejected join
    assert_eq!(system.sink.count_events_of_type("peer-joined"), 1);
}

#[tokio::test]
async fn test_code_join_creates_then_joins() {
    let system = TestSystem::new();
    system.join_code("host", "ABC234", false).await;
    system.join_code("guest", "ABC234", false).await;

    assert_eq!(system.members_of("ABC234"), vec!["host", "guest"]);
    assert_eq!(
        system.sink.events_for("host").last(),
        Some(&ServerEvent::PeerJoined {
            peer_id: "guest".to_string(),
            peer_name: "guest".to_string(),
        })
    );
    match system.sink.events_for("guest").as_slice() {
        [ServerEvent::RoomJoined {
            room_key, peer_ids, ..
        }] => {
            assert_eq!(room_key, "ABC234");
            assert_eq!(peer_ids, &vec!["host".to_string()]);
        }
        other => panic!("expected room-joined, got {:?}", other),
    }
}

#[tokio::test]
async fn test_public_search_only_joins_single_occupant_rooms() {
    let system = TestSystem::new();
    for id in ["a", "b", "c", "d"] {
        system.ensure_connected(id);
        system
            .manager
            .enqueue_direct(id, "en", id, Visibility::Public, None, false)
            .await
            .unwrap();
    }

    let room_of = |id: &str| {
        system
            .manager
            .registry()
            .get(id)
            .and_then(|s| s.room_key().map(String::from))
            .unwrap()
    };
    let first = room_of("a");
    let second = room_of("c");

    assert!(first.starts_with("en|"));
    assert_ne!(first, second);
    assert_eq!(room_of("b"), first);
    assert_eq!(room_of("d"), second);
    assert_eq!(system.members_of(&first), vec!["a", "b"]);
    assert_eq!(system.members_of(&second), vec!["c", "d"]);
}

#[tokio::test]
async fn test_leave_and_disconnect_report_remaining_members() {
    let system = TestSystem::new();
    for id in ["a", "b", "c"] {
        system.join_code(id, "TEAM77", false).await;
    }
    system.sink.clear();

    system
        .manager
        .handle_command("b", ClientCommand::Leave { room_key: None })
        .await
        .unwrap();

    let remaining = system.members_of("TEAM77");
    assert_eq!(remaining, vec!["a", "c"]);
    for id in ["a", "c"] {
        assert_eq!(
            system.sink.events_for(id),
            vec![ServerEvent::PeerLeft {
                peer_id: "b".to_string(),
                remaining_peer_ids: remaining.clone(),
            }]
        );
    }
    assert!(system.sink.events_for("b").is_empty());
    assert_eq!(
        system.manager.registry().state("b"),
        Some(SessionState::Idle)
    );

    system.manager.handle_disconnect("c").await.unwrap();
    assert_eq!(
        system.sink.events_for("a").last(),
        Some(&ServerEvent::PeerLeft {
            peer_id: "c".to_string(),
            remaining_peer_ids: vec!["a".to_string()],
        })
    );

    // The last member leaving frees the code
    system.manager.handle_disconnect("a").await.unwrap();
    assert!(!system.manager.directory().contains("TEAM77"));
}

#[tokio::test]
async fn test_enqueue_from_room_leaves_it_first() {
    let mut system = TestSystem::new();
    system.join_code("a", "PAIRUP", false).await;
    system.join_code("b", "PAIRUP", false).await;

    system
        .manager
        .enqueue_pool("a", "en", vec!["pair".to_string()], "a")
        .await
        .unwrap();

    assert_eq!(
        system.sink.events_for("b").last(),
        Some(&ServerEvent::PeerLeft {
            peer_id: "a".to_string(),
            remaining_peer_ids: vec!["b".to_string()],
        })
    );
    assert_eq!(system.members_of("PAIRUP"), vec!["b"]);

    system.enqueue_all(&["z"], "en", "pair").await;
    system.run_passes().await;
    let members: HashSet<String> = system
        .sink
        .matched_rooms()
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    assert_eq!(members, HashSet::from(["a".to_string(), "z".to_string()]));
}

#[tokio::test]
async fn test_signals_reach_only_their_target() {
    let system = TestSystem::new();
    for id in ["a", "b", "c"] {
        system.join_code(id, "SIGNAL", false).await;
    }
    system.sink.clear();

    let payload = json!({ "sdp": "v=0" });
    assert!(
        system
            .manager
            .relay_signal("a", "b", SignalKind::Offer, payload.clone())
            .await
    );

    assert_eq!(
        system.sink.events_for("b"),
        vec![ServerEvent::RelaySignal {
            sender_id: "a".to_string(),
            kind: SignalKind::Offer,
            payload,
        }]
    );
    assert!(system.sink.events_for("c").is_empty());
    assert!(system.sink.events_for("a").is_empty());

    // Undeliverable signals are dropped without failing the sender
    assert!(
        !system
            .manager
            .relay_signal("a", "ghost", SignalKind::Candidate, json!({}))
            .await
    );
    system.sink.set_offline("c");
    assert!(
        !system
            .manager
            .relay_signal("a", "c", SignalKind::Answer, json!({}))
            .await
    );
}

#[tokio::test]
async fn test_chat_broadcasts_to_other_members() {
    let system = TestSystem::new();
    for id in ["a", "b", "c"] {
        system.join_code(id, "CHAT99", false).await;
    }
    system.ensure_connected("outsider");
    system.sink.clear();

    let reached = system.manager.send_message("a", None, json!("hello")).await;
    assert_eq!(reached, 2);

    for id in ["b", "c"] {
        match system.sink.events_for(id).as_slice() {
            [ServerEvent::Message {
                sender_id,
                message,
                timestamp,
            }] => {
                assert_eq!(sender_id, "a");
                assert_eq!(message, &json!("hello"));
                assert!(*timestamp > 0);
            }
            other => panic!("expected one message, got {:?}", other),
        }
    }
    assert!(system.sink.events_for("a").is_empty());

    let reached = system
        .manager
        .send_message("outsider", Some("CHAT99"), json!("let me in"))
        .await;
    assert_eq!(reached, 0);
    assert_eq!(system.sink.count_events_of_type("message"), 2);
}

#[tokio::test]
async fn test_commands_from_text_frames() {
    let mut system = TestSystem::new();
    for id in ["a", "b"] {
        system.ensure_connected(id);
        let command = parse_command(&format!(
            r#"{{"type":"enqueue-pool","locale":"en","activities":["pair"],"displayName":"{}"}}"#,
            id
        ))
        .unwrap();
        system.manager.handle_command(id, command).await.unwrap();
    }
    system.run_passes().await;
    assert_eq!(system.sink.count_events_of_type("matched"), 2);

    // Unknown activities fall back to the default one
    system.ensure_connected("c");
    let command =
        parse_command(r#"{"type":"enqueue-pool","locale":"en","activities":["polo"]}"#).unwrap();
    system.manager.handle_command("c", command).await.unwrap();
    let entries = system.manager.pools().snapshot("en").unwrap();
    assert_eq!(entries[0].activities, vec!["pair".to_string()]);

    let command = parse_command(r#"{"type":"dequeue"}"#).unwrap();
    system.manager.handle_command("c", command).await.unwrap();
    assert_eq!(system.manager.pools().waiting_in("en"), 0);
}

#[tokio::test]
async fn test_commands_from_unknown_sessions_fail() {
    let system = TestSystem::new();
    let err = system
        .manager
        .handle_command("nobody", ClientCommand::Dequeue)
        .await
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<RendezvousError>(),
        Some(RendezvousError::SessionNotFound { .. })
    ));
}

struct Instance {
    manager: RoomManager,
    hub: Arc<ConnectionHub>,
}

/// One instance wired to a shared in-process bus, with its listener running
fn instance(bus: LocalRoomBus) -> Instance {
    let bus: Arc<dyn RoomEventBus> = Arc::new(bus);
    let hub = Arc::new(ConnectionHub::new());
    let directory = Arc::new(RoomDirectory::new());
    let metrics = Arc::new(MetricsCollector::new().unwrap());
    let sink = Arc::new(ForwardingSink::new(hub.clone(), Some(bus.clone())));

    let (manager, _worker) = RoomManager::with_metrics(
        Arc::new(test_catalog()),
        directory.clone(),
        sink,
        bus.clone(),
        metrics.clone(),
    );
    let listener = BusListener::new(directory, hub.clone(), metrics);
    tokio::spawn(listener.run(bus.subscribe()));

    Instance { manager, hub }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn next_event(rx: &mut UnboundedReceiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("event arrives in time")
        .expect("connection open")
}

#[tokio::test]
async fn test_rooms_are_shared_between_instances() {
    let bus = LocalRoomBus::new();
    let a = instance(bus.clone());
    let b = instance(bus.join());

    let mut alice = a.hub.register("alice");
    a.manager.connect("alice");
    a.manager
        .enqueue_direct("alice", "en", "Alice", Visibility::Private, Some("SHARED"), false)
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut alice).await,
        ServerEvent::RoomJoined { .. }
    ));

    wait_until(|| b.manager.directory().contains("SHARED")).await;

    let mut bob = b.hub.register("bob");
    b.manager.connect("bob");
    b.manager
        .enqueue_direct("bob", "en", "Bob", Visibility::Private, Some("SHARED"), false)
        .await
        .unwrap();

    match next_event(&mut bob).await {
        ServerEvent::RoomJoined { peer_ids, .. } => {
            assert_eq!(peer_ids, vec!["alice".to_string()])
        }
        other => panic!("expected room-joined, got {:?}", other),
    }
    // Delivered by instance A after instance B forwarded it
    assert_eq!(
        next_event(&mut alice).await,
        ServerEvent::PeerJoined {
            peer_id: "bob".to_string(),
            peer_name: "Bob".to_string(),
        }
    );

    wait_until(|| {
        a.manager
            .directory()
            .get("SHARED")
            .map(|room| room.members.len() == 2)
            .unwrap_or(false)
    })
    .await;

    assert!(
        a.manager
            .relay_signal("alice", "bob", SignalKind::Offer, json!({ "sdp": "x" }))
            .await
    );
    assert!(matches!(
        next_event(&mut bob).await,
        ServerEvent::RelaySignal { ref sender_id, .. } if sender_id == "alice"
    ));

    b.manager.handle_disconnect("bob").await.unwrap();
    assert_eq!(
        next_event(&mut alice).await,
        ServerEvent::PeerLeft {
            peer_id: "bob".to_string(),
            remaining_peer_ids: vec!["alice".to_string()],
        }
    );
}
