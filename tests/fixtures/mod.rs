//! Test fixtures shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use rendezvous::activity::{ActivityConfiguration, StaticActivityProvider};
use rendezvous::bus::MockRoomBus;
use rendezvous::error::{RendezvousError, Result};
use rendezvous::matchmaking::MatchWorker;
use rendezvous::relay::EventSink;
use rendezvous::room::RoomManager;
use rendezvous::types::{ServerEvent, SessionId, Visibility};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Event sink that records every delivery
///
/// Sessions marked offline fail with `UnknownTarget`, like a closed connection.
#[derive(Debug, Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<(SessionId, ServerEvent)>>,
    offline: Mutex<HashSet<SessionId>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, session_id: &str) {
        if let Ok(mut offline) = self.offline.lock() {
            offline.insert(session_id.to_string());
        }
    }

    pub fn events_for(&self, session_id: &str) -> Vec<ServerEvent> {
        self.delivered
            .lock()
            .map(|delivered| {
                delivered
                    .iter()
                    .filter(|(target, _)| target == session_id)
                    .map(|(_, event)| event.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Count deliveries of one event type across all sessions
    pub fn count_events_of_type(&self, name: &str) -> usize {
        self.delivered
            .lock()
            .map(|delivered| delivered.iter().filter(|(_, e)| e.name() == name).count())
            .unwrap_or(0)
    }

    /// Room keys of every `matched` event, one per member
    pub fn matched_rooms(&self) -> Vec<(SessionId, String)> {
        self.delivered
            .lock()
            .map(|delivered| {
                delivered
                    .iter()
                    .filter_map(|(target, event)| match event {
                        ServerEvent::Matched { room_key, .. } => {
                            Some((target.clone(), room_key.clone()))
                        }
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut delivered) = self.delivered.lock() {
            delivered.clear();
        }
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn deliver(&self, target: &str, event: ServerEvent) -> Result<()> {
        let offline = self
            .offline
            .lock()
            .map(|offline| offline.contains(target))
            .unwrap_or(false);
        if offline {
            return Err(RendezvousError::UnknownTarget {
                session_id: target.to_string(),
            }
            .into());
        }
        if let Ok(mut delivered) = self.delivered.lock() {
            delivered.push((target.to_string(), event));
        }
        Ok(())
    }
}

/// Catalog with a pair activity, a 3-4 group activity and a media activity
pub fn test_catalog() -> StaticActivityProvider {
    StaticActivityProvider::with_activities(
        vec![
            ActivityConfiguration::new("pair", 2, 2),
            ActivityConfiguration::new("squad", 3, 4),
            ActivityConfiguration::video(),
        ],
        "pair",
    )
    .expect("test catalog is valid")
}

/// A single instance with recording collaborators
pub struct TestSystem {
    pub manager: RoomManager,
    pub worker: MatchWorker,
    pub sink: Arc<RecordingSink>,
    pub bus: Arc<MockRoomBus>,
}

impl TestSystem {
    pub fn new() -> Self {
        let sink = Arc::new(RecordingSink::new());
        let bus = Arc::new(MockRoomBus::new());
        let (manager, worker) =
            RoomManager::new(Arc::new(test_catalog()), sink.clone(), bus.clone())
                .expect("room manager builds");
        Self {
            manager,
            worker,
            sink,
            bus,
        }
    }

    /// Connect a session unless it is already connected
    pub fn ensure_connected(&self, id: &str) {
        if !self.manager.registry().contains(id) {
            self.manager.connect(id);
        }
    }

    /// Enqueue every session for `activity` without running a pass
    pub async fn enqueue_all(&self, ids: &[&str], locale: &str, activity: &str) {
        for id in ids {
            self.ensure_connected(id);
            self.manager
                .enqueue_pool(id, locale, vec![activity.to_string()], id)
                .await
                .expect("enqueue succeeds");
        }
    }

    /// Join a room by code, connecting the session first
    pub async fn join_code(&self, id: &str, code: &str, media_required: bool) {
        self.ensure_connected(id);
        self.manager
            .enqueue_direct(id, "en", id, Visibility::Private, Some(code), media_required)
            .await
            .expect("direct join succeeds");
    }

    /// Run every queued matchmaking pass
    pub async fn run_passes(&mut self) -> usize {
        self.worker.drain().await
    }

    /// Members of a room, in join order
    pub fn members_of(&self, room_key: &str) -> Vec<String> {
        self.manager
            .directory()
            .get(room_key)
            .map(|room| room.members.iter().map(|m| m.id.clone()).collect())
            .unwrap_or_default()
    }
}

/// Session ids `s0`, `s1`, ... for bulk scenarios
pub fn session_ids(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("s{}", i)).collect()
}
