//! Outbound event delivery seam
//!
//! The relay only knows how to address a session; getting bytes onto a
//! connection, locally or through a peer instance, is the sink's business.

use crate::error::{RendezvousError, Result};
use crate::types::{ServerEvent, SessionId};
use async_trait::async_trait;
use std::collections::HashSet;

/// Delivers server events to sessions
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver `event` to `target`
    ///
    /// Fails with `RendezvousError::UnknownTarget` when no connection for the
    /// target can be reached.
    async fn deliver(&self, target: &str, event: ServerEvent) -> Result<()>;
}

/// Event sink that records deliveries, for tests
#[derive(Debug, Default)]
pub struct MockEventSink {
    delivered: std::sync::Mutex<Vec<(SessionId, ServerEvent)>>,
    unreachable: std::sync::Mutex<HashSet<SessionId>>,
}

impl MockEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make deliveries to `session_id` fail as unknown
    pub fn mark_unreachable(&self, session_id: &str) {
        if let Ok(mut unreachable) = self.unreachable.lock() {
            unreachable.insert(session_id.to_string());
        }
    }

    /// All deliveries in order
    pub fn delivered(&self) -> Vec<(SessionId, ServerEvent)> {
        self.delivered
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Events delivered to one session, in order
    pub fn events_for(&self, session_id: &str) -> Vec<ServerEvent> {
        self.delivered()
            .into_iter()
            .filter(|(target, _)| target == session_id)
            .map(|(_, event)| event)
            .collect()
    }

    /// Clear recorded deliveries
    pub fn clear(&self) {
        if let Ok(mut events) = self.delivered.lock() {
            events.clear();
        }
    }
}

#[async_trait]
impl EventSink for MockEventSink {
    async fn deliver(&self, target: &str, event: ServerEvent) -> Result<()> {
        let unreachable = self
            .unreachable
            .lock()
            .map(|set| set.contains(target))
            .unwrap_or(false);
        if unreachable {
            return Err(RendezvousError::UnknownTarget {
                session_id: target.to_string(),
            }
            .into());
        }

        self.delivered
            .lock()
            .map_err(|_| RendezvousError::lock_failed("mock sink"))?
            .push((target.to_string(), event));
        Ok(())
    }
}
