//! Metrics collection using Prometheus
//!
//! This module provides metrics collection for the rendezvous service:
//! sessions, rooms, matchmaking passes, relay traffic and the bus.

use crate::types::RoomKind;
use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Main metrics collector for the rendezvous service
#[derive(Clone)]
pub struct MetricsCollector {
    /// Prometheus registry
    registry: Arc<Registry>,

    /// Service-level metrics
    service_metrics: ServiceMetrics,

    /// Session metrics
    session_metrics: SessionMetrics,

    /// Room metrics
    room_metrics: RoomMetrics,

    /// Matchmaking pass metrics
    matching_metrics: MatchingMetrics,

    /// Signaling and chat relay metrics
    relay_metrics: RelayMetrics,
}

/// Service-level metrics
#[derive(Clone)]
pub struct ServiceMetrics {
    /// Service uptime in seconds
    pub uptime_seconds: IntGauge,

    /// Bus messages by direction and kind
    pub bus_messages_total: IntCounterVec,

    /// Bus errors by operation
    pub bus_errors_total: IntCounterVec,

    /// Health check status (0=unhealthy, 1=degraded, 2=healthy)
    pub health_status: IntGauge,

    /// Component health status
    pub component_health: IntGaugeVec,
}

/// Session metrics
#[derive(Clone)]
pub struct SessionMetrics {
    /// Sessions connected to this instance
    pub sessions_connected: IntGauge,

    /// Sessions waiting in any pool
    pub sessions_waiting: IntGauge,

    /// Client commands handled, by command
    pub commands_total: IntCounterVec,

    /// Client frames that could not be parsed
    pub malformed_commands_total: IntCounter,
}

/// Room metrics
#[derive(Clone)]
pub struct RoomMetrics {
    /// Rooms known to the directory, by kind
    pub active_rooms: IntGaugeVec,

    /// Rooms created on this instance, by kind
    pub rooms_created_total: IntCounterVec,

    /// Direct joins rejected because the room was full
    pub room_full_total: IntCounter,

    /// Members of a room at creation time
    pub room_size: HistogramVec,
}

/// Matchmaking metrics
#[derive(Clone)]
pub struct MatchingMetrics {
    /// Passes run, by outcome
    pub passes_total: IntCounterVec,

    /// Pass duration, snapshot to commit
    pub pass_duration: Histogram,

    /// Sessions placed into rooms, by activity
    pub sessions_matched_total: IntCounterVec,

    /// Candidate groups abandoned at commit time
    pub groups_abandoned_total: IntCounter,
}

/// Relay metrics
#[derive(Clone)]
pub struct RelayMetrics {
    /// Targeted signals delivered, by kind
    pub signals_relayed_total: IntCounterVec,

    /// Targeted signals dropped because the target was unreachable
    pub signals_dropped_total: IntCounter,

    /// Chat messages relayed
    pub messages_relayed_total: IntCounter,

    /// Server events delivered, by event
    pub events_delivered_total: IntCounterVec,
}

impl MetricsCollector {
    /// Create a new metrics collector with default registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        Self::with_registry(registry)
    }

    /// Create a new metrics collector with custom registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let service_metrics = ServiceMetrics::new(&registry)?;
        let session_metrics = SessionMetrics::new(&registry)?;
        let room_metrics = RoomMetrics::new(&registry)?;
        let matching_metrics = MatchingMetrics::new(&registry)?;
        let relay_metrics = RelayMetrics::new(&registry)?;

        Ok(Self {
            registry,
            service_metrics,
            session_metrics,
            room_metrics,
            matching_metrics,
            relay_metrics,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn service(&self) -> &ServiceMetrics {
        &self.service_metrics
    }

    pub fn session(&self) -> &SessionMetrics {
        &self.session_metrics
    }

    pub fn room(&self) -> &RoomMetrics {
        &self.room_metrics
    }

    pub fn matching(&self) -> &MatchingMetrics {
        &self.matching_metrics
    }

    pub fn relay(&self) -> &RelayMetrics {
        &self.relay_metrics
    }

    /// Refresh the point-in-time gauges
    pub fn update_gauges(
        &self,
        sessions_connected: usize,
        sessions_waiting: usize,
        rooms_by_kind: &HashMap<RoomKind, usize>,
    ) {
        self.session_metrics
            .sessions_connected
            .set(sessions_connected as i64);
        self.session_metrics
            .sessions_waiting
            .set(sessions_waiting as i64);

        for kind in [RoomKind::Matched, RoomKind::Public, RoomKind::Private] {
            let count = rooms_by_kind.get(&kind).copied().unwrap_or(0);
            self.room_metrics
                .active_rooms
                .with_label_values(&[kind.as_str()])
                .set(count as i64);
        }
    }

    pub fn record_command(&self, command: &str) {
        self.session_metrics
            .commands_total
            .with_label_values(&[command])
            .inc();
    }

    pub fn record_malformed_command(&self) {
        self.session_metrics.malformed_commands_total.inc();
    }

    /// Record a room being created with its initial size
    pub fn record_room_created(&self, kind: RoomKind, size: usize) {
        self.room_metrics
            .rooms_created_total
            .with_label_values(&[kind.as_str()])
            .inc();
        self.room_metrics
            .room_size
            .with_label_values(&[kind.as_str()])
            .observe(size as f64);
    }

    pub fn record_room_full(&self) {
        self.room_metrics.room_full_total.inc();
    }

    /// Record one matchmaking pass
    pub fn record_matching_pass(&self, rooms_formed: usize, retry: bool, duration: Duration) {
        let outcome = match (rooms_formed, retry) {
            (_, true) => "retry",
            (0, false) => "idle",
            (_, false) => "formed",
        };
        self.matching_metrics
            .passes_total
            .with_label_values(&[outcome])
            .inc();
        self.matching_metrics
            .pass_duration
            .observe(duration.as_secs_f64());
    }

    pub fn record_sessions_matched(&self, activity: &str, count: usize) {
        self.matching_metrics
            .sessions_matched_total
            .with_label_values(&[activity])
            .inc_by(count as u64);
    }

    pub fn record_group_abandoned(&self) {
        self.matching_metrics.groups_abandoned_total.inc();
    }

    pub fn record_signal(&self, kind: &str, delivered: bool) {
        if delivered {
            self.relay_metrics
                .signals_relayed_total
                .with_label_values(&[kind])
                .inc();
        } else {
            self.relay_metrics.signals_dropped_total.inc();
        }
    }

    pub fn record_message_relayed(&self) {
        self.relay_metrics.messages_relayed_total.inc();
    }

    pub fn record_event_delivered(&self, event: &str) {
        self.relay_metrics
            .events_delivered_total
            .with_label_values(&[event])
            .inc();
    }

    /// Record a bus message; `direction` is "published" or "received"
    pub fn record_bus_message(&self, direction: &str, kind: &str) {
        self.service_metrics
            .bus_messages_total
            .with_label_values(&[direction, kind])
            .inc();
    }

    pub fn record_bus_error(&self, operation: &str) {
        self.service_metrics
            .bus_errors_total
            .with_label_values(&[operation])
            .inc();
    }

    pub fn update_uptime(&self, uptime: Duration) {
        self.service_metrics
            .uptime_seconds
            .set(uptime.as_secs() as i64);
    }

    /// Update health status
    pub fn update_health_status(&self, status: u8) {
        self.service_metrics.health_status.set(status as i64);
    }

    /// Update component health
    pub fn update_component_health(&self, component: &str, healthy: bool) {
        let status = if healthy { 1 } else { 0 };
        self.service_metrics
            .component_health
            .with_label_values(&[component])
            .set(status);
    }

    /// Create a timer for measuring operation duration
    pub fn start_timer(&self) -> MetricsTimer {
        MetricsTimer::new()
    }
}

/// Timer for measuring operation durations
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get the elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return the duration
    pub fn stop(self) -> Duration {
        self.elapsed()
    }
}

impl ServiceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let uptime_seconds =
            IntGauge::new("rendezvous_uptime_seconds", "Service uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let bus_messages_total = IntCounterVec::new(
            Opts::new("rendezvous_bus_messages_total", "Cross-instance bus messages"),
            &["direction", "kind"],
        )?;
        registry.register(Box::new(bus_messages_total.clone()))?;

        let bus_errors_total = IntCounterVec::new(
            Opts::new("rendezvous_bus_errors_total", "Cross-instance bus errors"),
            &["operation"],
        )?;
        registry.register(Box::new(bus_errors_total.clone()))?;

        let health_status = IntGauge::new(
            "rendezvous_health_status",
            "Health status (0=unhealthy, 1=degraded, 2=healthy)",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        let component_health = IntGaugeVec::new(
            Opts::new("rendezvous_component_health", "Component health status"),
            &["component"],
        )?;
        registry.register(Box::new(component_health.clone()))?;

        Ok(Self {
            uptime_seconds,
            bus_messages_total,
            bus_errors_total,
            health_status,
            component_health,
        })
    }
}

impl SessionMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let sessions_connected = IntGauge::new(
            "rendezvous_sessions_connected",
            "Sessions connected to this instance",
        )?;
        registry.register(Box::new(sessions_connected.clone()))?;

        let sessions_waiting = IntGauge::new(
            "rendezvous_sessions_waiting",
            "Sessions waiting for pool matching",
        )?;
        registry.register(Box::new(sessions_waiting.clone()))?;

        let commands_total = IntCounterVec::new(
            Opts::new("rendezvous_commands_total", "Client commands handled"),
            &["command"],
        )?;
        registry.register(Box::new(commands_total.clone()))?;

        let malformed_commands_total = IntCounter::new(
            "rendezvous_malformed_commands_total",
            "Client frames that could not be parsed",
        )?;
        registry.register(Box::new(malformed_commands_total.clone()))?;

        Ok(Self {
            sessions_connected,
            sessions_waiting,
            commands_total,
            malformed_commands_total,
        })
    }
}

impl RoomMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let active_rooms = IntGaugeVec::new(
            Opts::new("rendezvous_active_rooms", "Rooms known to the directory"),
            &["kind"],
        )?;
        registry.register(Box::new(active_rooms.clone()))?;

        let rooms_created_total = IntCounterVec::new(
            Opts::new("rendezvous_rooms_created_total", "Total rooms created"),
            &["kind"],
        )?;
        registry.register(Box::new(rooms_created_total.clone()))?;

        let room_full_total = IntCounter::new(
            "rendezvous_room_full_total",
            "Direct joins rejected because the room was full",
        )?;
        registry.register(Box::new(room_full_total.clone()))?;

        let room_size = HistogramVec::new(
            HistogramOpts::new("rendezvous_room_size", "Members of a room at creation")
                .buckets(vec![1.0, 2.0, 3.0, 4.0, 6.0, 8.0, 12.0, 16.0]),
            &["kind"],
        )?;
        registry.register(Box::new(room_size.clone()))?;

        Ok(Self {
            active_rooms,
            rooms_created_total,
            room_full_total,
            room_size,
        })
    }
}

impl MatchingMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let passes_total = IntCounterVec::new(
            Opts::new("rendezvous_matching_passes_total", "Matchmaking passes run"),
            &["outcome"],
        )?;
        registry.register(Box::new(passes_total.clone()))?;

        let pass_duration = Histogram::with_opts(
            HistogramOpts::new(
                "rendezvous_matching_pass_duration_seconds",
                "Matchmaking pass duration",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
        )?;
        registry.register(Box::new(pass_duration.clone()))?;

        let sessions_matched_total = IntCounterVec::new(
            Opts::new(
                "rendezvous_sessions_matched_total",
                "Sessions placed into rooms by matchmaking",
            ),
            &["activity"],
        )?;
        registry.register(Box::new(sessions_matched_total.clone()))?;

        let groups_abandoned_total = IntCounter::new(
            "rendezvous_groups_abandoned_total",
            "Candidate groups that fell below their minimum at commit",
        )?;
        registry.register(Box::new(groups_abandoned_total.clone()))?;

        Ok(Self {
            passes_total,
            pass_duration,
            sessions_matched_total,
            groups_abandoned_total,
        })
    }
}

impl RelayMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let signals_relayed_total = IntCounterVec::new(
            Opts::new("rendezvous_signals_relayed_total", "Targeted signals relayed"),
            &["kind"],
        )?;
        registry.register(Box::new(signals_relayed_total.clone()))?;

        let signals_dropped_total = IntCounter::new(
            "rendezvous_signals_dropped_total",
            "Targeted signals dropped for an unreachable target",
        )?;
        registry.register(Box::new(signals_dropped_total.clone()))?;

        let messages_relayed_total = IntCounter::new(
            "rendezvous_messages_relayed_total",
            "Room chat messages relayed",
        )?;
        registry.register(Box::new(messages_relayed_total.clone()))?;

        let events_delivered_total = IntCounterVec::new(
            Opts::new("rendezvous_events_delivered_total", "Server events delivered"),
            &["event"],
        )?;
        registry.register(Box::new(events_delivered_total.clone()))?;

        Ok(Self {
            signals_relayed_total,
            signals_dropped_total,
            messages_relayed_total,
            events_delivered_total,
        })
    }
}
