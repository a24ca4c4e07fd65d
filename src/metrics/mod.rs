//! Metrics and monitoring for the rendezvous service
//!
//! Prometheus collectors grouped by concern, plus the HTTP server that
//! exposes them next to the health endpoints.

pub mod collector;
pub mod health;

pub use collector::{
    MatchingMetrics, MetricsCollector, MetricsTimer, RelayMetrics, RoomMetrics, ServiceMetrics,
    SessionMetrics,
};
pub use health::{encode_metrics, HttpServer, HttpServerConfig};
