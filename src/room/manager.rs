//! Room manager: the session lifecycle state machine
//!
//! This module provides the RoomManager that turns client commands into
//! transitions between idle, waiting and in-room, keeping the session registry,
//! the waiting pools and the room directory consistent with each other.

use crate::activity::ActivityProvider;
use crate::bus::RoomEventBus;
use crate::error::{RendezvousError, Result};
use crate::matchmaking::{MatchScheduler, MatchWorker, MatchmakingEngine};
use crate::metrics::MetricsCollector;
use crate::pool::WaitingPools;
use crate::relay::{EventSink, PresenceRelay};
use crate::room::directory::{JoinOutcome, RoomDirectory};
use crate::session::{SessionRegistry, SessionState};
use crate::types::{
    BusMessage, ClientCommand, LeaveReason, MatchCriteria, Member, RoomMutation, SignalKind,
    Visibility,
};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Statistics about room manager operations
#[derive(Debug, Clone, Default)]
pub struct RoomManagerStats {
    /// Total number of commands handled
    pub commands_handled: u64,
    /// Total number of pool enqueues
    pub pool_enqueues: u64,
    /// Total number of successful direct joins
    pub direct_joins: u64,
    /// Total number of joins rejected as full
    pub rooms_full: u64,
    /// Total number of room departures
    pub departures: u64,
    /// Current number of rooms in the directory
    pub active_rooms: usize,
    /// Current number of room members across the directory
    pub members_in_rooms: usize,
    /// Current number of sessions connected to this instance
    pub sessions_connected: usize,
    /// Current number of sessions in waiting pools
    pub sessions_waiting: usize,
}

/// The main room manager
#[derive(Clone)]
pub struct RoomManager {
    /// Per-connection session state
    registry: Arc<SessionRegistry>,
    /// Waiting pools by locale
    pools: Arc<WaitingPools>,
    /// Every room known to the deployment
    directory: Arc<RoomDirectory>,
    /// Activity catalog for pool intents
    activity_provider: Arc<dyn ActivityProvider>,
    /// Queue of matchmaking passes
    scheduler: MatchScheduler,
    /// Presence and signaling output
    relay: PresenceRelay,
    /// Peer instances
    bus: Arc<dyn RoomEventBus>,
    /// Manager statistics
    stats: Arc<RwLock<RoomManagerStats>>,
    /// Metrics collector for recording performance data
    metrics_collector: Arc<MetricsCollector>,
}

impl RoomManager {
    /// Create a new room manager with its own metrics registry
    ///
    /// The returned worker must be driven for pool intents to form rooms.
    pub fn new(
        activity_provider: Arc<dyn ActivityProvider>,
        sink: Arc<dyn EventSink>,
        bus: Arc<dyn RoomEventBus>,
    ) -> Result<(Self, MatchWorker)> {
        let metrics_collector = Arc::new(MetricsCollector::new()?);
        Ok(Self::with_metrics(
            activity_provider,
            Arc::new(RoomDirectory::new()),
            sink,
            bus,
            metrics_collector,
        ))
    }

    /// Create a new room manager with metrics collector
    pub fn with_metrics(
        activity_provider: Arc<dyn ActivityProvider>,
        directory: Arc<RoomDirectory>,
        sink: Arc<dyn EventSink>,
        bus: Arc<dyn RoomEventBus>,
        metrics_collector: Arc<MetricsCollector>,
    ) -> (Self, MatchWorker) {
        let registry = Arc::new(SessionRegistry::new());
        let pools = Arc::new(WaitingPools::new());
        let relay = PresenceRelay::new(sink, metrics_collector.clone());

        let engine = MatchmakingEngine::new(
            pools.clone(),
            registry.clone(),
            directory.clone(),
            activity_provider.clone(),
            relay.clone(),
            bus.clone(),
            metrics_collector.clone(),
        );
        let (scheduler, worker) = MatchScheduler::new(Arc::new(engine));

        let manager = Self {
            registry,
            pools,
            directory,
            activity_provider,
            scheduler,
            relay,
            bus,
            stats: Arc::new(RwLock::new(RoomManagerStats::default())),
            metrics_collector,
        };
        (manager, worker)
    }

    /// Register a freshly connected session
    pub fn connect(&self, session_id: &str) {
        self.registry.register(session_id);
        debug!("Session {} connected", session_id);
    }

    /// Handle one command from a connected session
    pub async fn handle_command(&self, session_id: &str, command: ClientCommand) -> Result<()> {
        if !self.registry.contains(session_id) {
            return Err(RendezvousError::SessionNotFound {
                session_id: session_id.to_string(),
            }
            .into());
        }

        self.metrics_collector.record_command(command.name());
        self.update_stats(|stats| stats.commands_handled += 1);
        debug!("Session {} sent {}", session_id, command.name());

        match command {
            ClientCommand::EnqueuePool {
                locale,
                activities,
                display_name,
            } => {
                self.enqueue_pool(session_id, &locale, activities, &display_name)
                    .await
            }
            ClientCommand::EnqueueDirect {
                locale,
                display_name,
                visibility,
                room_code,
                media_required,
            } => {
                self.enqueue_direct(
                    session_id,
                    &locale,
                    &display_name,
                    visibility,
                    room_code.as_deref(),
                    media_required,
                )
                .await
            }
            ClientCommand::Dequeue => {
                self.dequeue(session_id)?;
                Ok(())
            }
            ClientCommand::Leave { room_key } => {
                self.leave(session_id, room_key.as_deref(), LeaveReason::Explicit)
                    .await;
                Ok(())
            }
            ClientCommand::RelaySignal {
                target_id,
                kind,
                payload,
            } => {
                self.relay_signal(session_id, &target_id, kind, payload)
                    .await;
                Ok(())
            }
            ClientCommand::SendMessage { room_key, message } => {
                self.send_message(session_id, room_key.as_deref(), message)
                    .await;
                Ok(())
            }
        }
    }

    /// Put a session into the waiting pool of `locale`
    ///
    /// Any room the session is in is left first.
    pub async fn enqueue_pool(
        &self,
        session_id: &str,
        locale: &str,
        activities: Vec<String>,
        display_name: &str,
    ) -> Result<()> {
        let activities = self.resolve_activities(session_id, activities);
        self.registry.declare(
            session_id,
            display_name,
            MatchCriteria {
                locale: locale.to_string(),
                activities: activities.clone(),
                visibility: Visibility::default(),
                media_required: false,
            },
        )?;

        self.dequeue(session_id)?;
        self.leave(session_id, None, LeaveReason::Requeue).await;

        self.registry.mark_waiting(session_id, locale)?;
        self.pools
            .enqueue(locale, session_id, display_name, activities)?;
        self.update_stats(|stats| stats.pool_enqueues += 1);

        info!("Session {} waiting in locale '{}'", session_id, locale);
        self.scheduler.trigger(locale);
        Ok(())
    }

    /// Keep the known activities, falling back to the default activity
    fn resolve_activities(&self, session_id: &str, requested: Vec<String>) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut activities = Vec::new();
        for name in requested {
            if self.activity_provider.get_activity(&name).is_none() {
                warn!(
                    "Session {} asked for unknown activity '{}', ignoring it",
                    session_id, name
                );
                continue;
            }
            if seen.insert(name.clone()) {
                activities.push(name);
            }
        }

        if activities.is_empty() {
            activities.push(self.activity_provider.default_activity());
        }
        activities
    }

    /// Search for or create a room and join it, bypassing the waiting pool
    pub async fn enqueue_direct(
        &self,
        session_id: &str,
        locale: &str,
        display_name: &str,
        visibility: Visibility,
        room_code: Option<&str>,
        media_required: bool,
    ) -> Result<()> {
        self.registry.declare(
            session_id,
            display_name,
            MatchCriteria {
                locale: locale.to_string(),
                activities: Vec::new(),
                visibility,
                media_required,
            },
        )?;

        // A rejected join leaves the session idle
        self.dequeue(session_id)?;
        self.leave(session_id, None, LeaveReason::Requeue).await;

        let member = Member {
            id: session_id.to_string(),
            name: display_name.to_string(),
        };
        let code = room_code.map(str::trim).filter(|code| !code.is_empty());

        let outcome = match (code, visibility) {
            (Some(code), _) => self
                .directory
                .join_code(code, member.clone(), media_required)?,
            (None, Visibility::Public) => {
                self.directory
                    .join_public(locale, member.clone(), media_required)?
            }
            (None, Visibility::Private) => JoinOutcome::Joined {
                room: self
                    .directory
                    .create_private(member.clone(), media_required)?,
                created: true,
            },
        };

        match outcome {
            JoinOutcome::Full { room_key } => {
                self.update_stats(|stats| stats.rooms_full += 1);
                self.relay.send_room_full(session_id, &room_key).await;
            }
            JoinOutcome::Joined { room, created } => {
                self.registry.enter_room(session_id, &room.key)?;
                if created {
                    self.metrics_collector.record_room_created(room.kind, 1);
                }
                self.update_stats(|stats| stats.direct_joins += 1);
                info!(
                    "Session {} joined {} room {} ({} members)",
                    session_id,
                    room.kind.as_str(),
                    room.key,
                    room.members.len()
                );

                self.relay.announce_join(&room, &member).await;
                self.publish(RoomMutation::MemberJoined {
                    room_key: room.key.clone(),
                    activity: room.activity.clone(),
                    room_kind: room.kind,
                    bounds: room.bounds,
                    media: room.media,
                    member,
                })
                .await;
            }
        }
        Ok(())
    }

    /// Take a session out of its waiting pool, if it is in one
    ///
    /// Returns whether the session was waiting.
    pub fn dequeue(&self, session_id: &str) -> Result<bool> {
        let Some(SessionState::Waiting { locale }) = self.registry.state(session_id) else {
            return Ok(false);
        };

        // Pool first, so a concurrent pass cannot claim the session afterwards
        self.pools.remove(&locale, session_id)?;
        let was_waiting = self.registry.clear_waiting(session_id).is_some();
        if was_waiting {
            debug!("Session {} left the '{}' pool", session_id, locale);
        }
        Ok(was_waiting)
    }

    /// Leave the session's current room
    ///
    /// With `room_key` the session only leaves if that is its current room.
    pub async fn leave(&self, session_id: &str, room_key: Option<&str>, reason: LeaveReason) {
        let Some(key) = self.registry.clear_room(session_id, room_key) else {
            if let Some(requested) = room_key {
                debug!(
                    "Session {} is not in room {}, ignoring leave",
                    session_id, requested
                );
            }
            return;
        };

        let Some(departure) = self.directory.leave(&key, session_id) else {
            warn!("Session {} was not a member of its room {}", session_id, key);
            return;
        };

        self.update_stats(|stats| stats.departures += 1);
        info!(
            "Session {} left room {} ({}), {} remaining",
            session_id,
            key,
            reason.as_str(),
            departure.room.members.len()
        );

        self.relay.announce_leave(&departure).await;
        self.publish(RoomMutation::MemberLeft {
            room_key: key,
            session_id: session_id.to_string(),
        })
        .await;
    }

    /// The connection of a session ended
    pub async fn handle_disconnect(&self, session_id: &str) -> Result<()> {
        self.dequeue(session_id)?;
        self.leave(session_id, None, LeaveReason::Disconnect).await;
        self.registry.remove(session_id);
        debug!("Session {} disconnected", session_id);
        Ok(())
    }

    /// Forward a signaling payload to one recipient
    pub async fn relay_signal(
        &self,
        sender_id: &str,
        target_id: &str,
        kind: SignalKind,
        payload: serde_json::Value,
    ) -> bool {
        let delivered = self
            .relay
            .relay_signal(sender_id, target_id, kind, payload)
            .await;
        if !delivered {
            debug!(
                "Dropped {} signal from {} to {}",
                kind.as_str(),
                sender_id,
                target_id
            );
        }
        delivered
    }

    /// Broadcast a chat message to the other members of the sender's room
    ///
    /// Returns the number of members reached; senders outside the room reach no one.
    pub async fn send_message(
        &self,
        sender_id: &str,
        room_key: Option<&str>,
        message: serde_json::Value,
    ) -> usize {
        let key = match room_key {
            Some(key) => key.to_string(),
            None => {
                let current = self
                    .registry
                    .get(sender_id)
                    .and_then(|session| session.room_key().map(String::from));
                match current {
                    Some(key) => key,
                    None => {
                        warn!("Session {} sent a message outside any room", sender_id);
                        return 0;
                    }
                }
            }
        };

        match self.directory.get(&key) {
            Some(room) if room.members.iter().any(|m| m.id == sender_id) => {
                self.relay.relay_message(sender_id, &room, message).await
            }
            _ => {
                warn!(
                    "Session {} sent a message to room {} it is not a member of",
                    sender_id, key
                );
                0
            }
        }
    }

    async fn publish(&self, mutation: RoomMutation) {
        let key = mutation.room_key().to_string();
        if let Err(e) = self.bus.publish(BusMessage::Mutation(mutation)).await {
            warn!("Failed to publish mutation of room {}: {}", key, e);
        }
    }

    fn update_stats(&self, update: impl FnOnce(&mut RoomManagerStats)) {
        match self.stats.write() {
            Ok(mut stats) => update(&mut stats),
            Err(_) => warn!("{}", RendezvousError::lock_failed("room manager stats")),
        }
    }

    /// Get manager statistics
    pub fn get_stats(&self) -> Result<RoomManagerStats> {
        let mut stats = self
            .stats
            .read()
            .map_err(|_| RendezvousError::lock_failed("room manager stats"))?
            .clone();
        stats.active_rooms = self.directory.room_count();
        stats.members_in_rooms = self.directory.member_count();
        stats.sessions_connected = self.registry.len();
        stats.sessions_waiting = self.pools.total_waiting();
        Ok(stats)
    }

    /// Push current gauges into the metrics registry
    pub fn refresh_metrics(&self) {
        self.metrics_collector.update_gauges(
            self.registry.len(),
            self.pools.total_waiting(),
            &self.directory.counts_by_kind(),
        );
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn pools(&self) -> &Arc<WaitingPools> {
        &self.pools
    }

    pub fn directory(&self) -> &Arc<RoomDirectory> {
        &self.directory
    }

    pub fn scheduler(&self) -> &MatchScheduler {
        &self.scheduler
    }

    pub fn instance_id(&self) -> &str {
        self.bus.instance_id()
    }
}
