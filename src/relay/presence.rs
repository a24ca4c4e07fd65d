//! Presence broadcasts, targeted signaling and room chat
//!
//! The relay is a dumb pipe: it never inspects payloads and never persists
//! anything. Undeliverable events are dropped after a log line.

use crate::error::RendezvousError;
use crate::metrics::MetricsCollector;
use crate::relay::sink::EventSink;
use crate::room::{Departure, RoomSnapshot};
use crate::types::{Member, RoomKey, ServerEvent, SignalKind};
use crate::utils::relay_timestamp;
use std::sync::Arc;
use tracing::{debug, warn};

/// Emits presence, signaling and chat events through an `EventSink`
#[derive(Clone)]
pub struct PresenceRelay {
    sink: Arc<dyn EventSink>,
    metrics_collector: Arc<MetricsCollector>,
}

impl PresenceRelay {
    pub fn new(sink: Arc<dyn EventSink>, metrics_collector: Arc<MetricsCollector>) -> Self {
        Self {
            sink,
            metrics_collector,
        }
    }

    /// Deliver one event; returns whether it reached a connection
    async fn send(&self, target: &str, event: ServerEvent) -> bool {
        let name = event.name();
        match self.sink.deliver(target, event).await {
            Ok(()) => {
                self.metrics_collector.record_event_delivered(name);
                true
            }
            Err(e) => {
                match e.downcast_ref::<RendezvousError>() {
                    Some(RendezvousError::UnknownTarget { .. }) => {
                        debug!("Dropping {} for unreachable session {}", name, target)
                    }
                    _ => warn!("Failed to deliver {} to {}: {}", name, target, e),
                }
                false
            }
        }
    }

    /// Tell every member of a freshly matched room about the match
    pub async fn announce_matched(&self, room: &RoomSnapshot, min_players: usize) {
        let peer_names = room.names();
        for member in &room.members {
            let event = ServerEvent::Matched {
                activity: room.activity.clone(),
                room_key: room.key.clone(),
                self_id: member.id.clone(),
                peer_ids: room.peer_ids(&member.id),
                peer_names: peer_names.clone(),
                min_players,
            };
            self.send(&member.id, event).await;
        }
    }

    /// Send the joiner its room, then tell existing members about the joiner
    ///
    /// `room` is the membership after the join.
    pub async fn announce_join(&self, room: &RoomSnapshot, joiner: &Member) {
        let joined = ServerEvent::RoomJoined {
            room_key: room.key.clone(),
            self_id: joiner.id.clone(),
            peer_ids: room.peer_ids(&joiner.id),
            peer_names: room.names(),
        };
        self.send(&joiner.id, joined).await;

        for peer in room.members.iter().filter(|m| m.id != joiner.id) {
            let event = ServerEvent::PeerJoined {
                peer_id: joiner.id.clone(),
                peer_name: joiner.name.clone(),
            };
            self.send(&peer.id, event).await;
        }
    }

    /// Tell the remaining members who left and who is still there
    pub async fn announce_leave(&self, departure: &Departure) {
        let remaining = departure.remaining_ids();
        for peer in &remaining {
            let event = ServerEvent::PeerLeft {
                peer_id: departure.member.id.clone(),
                remaining_peer_ids: remaining.clone(),
            };
            self.send(peer, event).await;
        }
    }

    /// Report a rejected join to the caller only
    pub async fn send_room_full(&self, session_id: &str, room_key: &RoomKey) {
        self.metrics_collector.record_room_full();
        let event = ServerEvent::RoomFull {
            room_key: room_key.clone(),
        };
        self.send(session_id, event).await;
    }

    /// Forward a signaling payload to its named recipient only
    pub async fn relay_signal(
        &self,
        sender_id: &str,
        target_id: &str,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> bool {
        let event = ServerEvent::RelaySignal {
            sender_id: sender_id.to_string(),
            kind,
            payload,
        };
        let delivered = self.send(target_id, event).await;
        self.metrics_collector
            .record_signal(kind.as_str(), delivered);
        delivered
    }

    /// Broadcast a chat message to every other member of the room
    ///
    /// Returns the number of members it reached.
    pub async fn relay_message(
        &self,
        sender_id: &str,
        room: &RoomSnapshot,
        message: serde_json::Value,
    ) -> usize {
        let timestamp = relay_timestamp();
        let mut reached = 0;
        for peer in room.members.iter().filter(|m| m.id != sender_id) {
            let event = ServerEvent::Message {
                sender_id: sender_id.to_string(),
                message: message.clone(),
                timestamp,
            };
            if self.send(&peer.id, event).await {
                reached += 1;
            }
        }
        self.metrics_collector.record_message_relayed();
        reached
    }
}
