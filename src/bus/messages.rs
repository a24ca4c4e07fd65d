//! Bus message envelope and naming

use crate::error::{RendezvousError, Result};
use crate::types::{BusMessage, InstanceId};
use serde::{Deserialize, Serialize};

/// Fanout exchange every instance publishes room events to
pub const ROOM_EVENTS_EXCHANGE: &str = "rendezvous.room_events";

/// Routing keys, informational on a fanout exchange
pub const MUTATION_ROUTING_KEY: &str = "room.mutation";
pub const DELIVER_ROUTING_KEY: &str = "session.deliver";

/// Name of the exclusive queue an instance consumes from
pub fn instance_queue_name(exchange: &str, instance_id: &str) -> String {
    format!("{}.{}", exchange, instance_id)
}

/// Message envelope with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub payload: BusMessage,
    pub correlation_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Instance that published the message
    pub origin: InstanceId,
    pub routing_key: String,
}

impl MessageEnvelope {
    /// Wrap a bus message published by `origin`
    pub fn new(payload: BusMessage, origin: &str) -> Self {
        let routing_key = match &payload {
            BusMessage::Mutation(_) => MUTATION_ROUTING_KEY,
            BusMessage::Deliver { .. } => DELIVER_ROUTING_KEY,
        };
        Self {
            payload,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            origin: origin.to_string(),
            routing_key: routing_key.to_string(),
        }
    }

    /// Short label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match &self.payload {
            BusMessage::Mutation(_) => "mutation",
            BusMessage::Deliver { .. } => "deliver",
        }
    }

    /// Serialize the envelope to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            RendezvousError::InternalError {
                message: format!("Failed to serialize bus message: {}", e),
            }
            .into()
        })
    }

    /// Deserialize envelope from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            RendezvousError::InvalidCommand {
                reason: format!("Failed to deserialize bus message: {}", e),
            }
            .into()
        })
    }
}
