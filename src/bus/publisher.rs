//! Cross-instance room event bus
//!
//! Instances publish room mutations and remote deliveries, and subscribe to
//! what their peers publish. A subscription never yields the subscriber's own
//! messages.

use crate::bus::messages::MessageEnvelope;
use crate::error::Result;
use crate::types::{BusMessage, InstanceId};
use crate::utils::generate_instance_id;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Capacity of in-process fan-out channels
pub const BUS_CHANNEL_CAPACITY: usize = 1024;

/// Trait for the bus connecting the instances of a deployment
#[async_trait]
pub trait RoomEventBus: Send + Sync {
    /// Identifier of this instance on the bus
    fn instance_id(&self) -> &str;

    /// Publish a message to every peer instance
    async fn publish(&self, message: BusMessage) -> Result<()>;

    /// Receive what peer instances publish
    fn subscribe(&self) -> BusSubscription;

    /// Whether the bus can currently reach its peers
    fn is_connected(&self) -> bool {
        true
    }

    /// Release broker resources
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Stream of peer messages, with this instance's own messages filtered out
pub struct BusSubscription {
    receiver: broadcast::Receiver<MessageEnvelope>,
    instance_id: InstanceId,
}

impl BusSubscription {
    pub fn new(receiver: broadcast::Receiver<MessageEnvelope>, instance_id: &str) -> Self {
        Self {
            receiver,
            instance_id: instance_id.to_string(),
        }
    }

    /// Next peer message, or None once the bus is gone
    pub async fn recv(&mut self) -> Option<MessageEnvelope> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) if envelope.origin == self.instance_id => {
                    debug!("Skipping own bus message {}", envelope.correlation_id);
                }
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Bus subscriber lagged, {} messages skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// In-process bus
///
/// A standalone instance has no peers, so publishing is a no-op fan-out.
/// Buses created with `join` share one channel and behave like separate
/// instances of one deployment.
#[derive(Clone)]
pub struct LocalRoomBus {
    instance_id: InstanceId,
    channel: broadcast::Sender<MessageEnvelope>,
}

impl LocalRoomBus {
    pub fn new() -> Self {
        let (channel, _) = broadcast::channel(BUS_CHANNEL_CAPACITY);
        Self {
            instance_id: generate_instance_id(),
            channel,
        }
    }

    /// Another instance on the same in-process bus
    pub fn join(&self) -> Self {
        Self {
            instance_id: generate_instance_id(),
            channel: self.channel.clone(),
        }
    }
}

impl Default for LocalRoomBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RoomEventBus for LocalRoomBus {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn publish(&self, message: BusMessage) -> Result<()> {
        let envelope = MessageEnvelope::new(message, &self.instance_id);
        // No receivers just means no peers are listening
        let _ = self.channel.send(envelope);
        Ok(())
    }

    fn subscribe(&self) -> BusSubscription {
        BusSubscription::new(self.channel.subscribe(), &self.instance_id)
    }
}

/// Bus that records published messages, for tests
#[derive(Debug, Default)]
pub struct MockRoomBus {
    published: std::sync::Mutex<Vec<BusMessage>>,
}

impl MockRoomBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all published messages (for testing)
    pub fn published(&self) -> Vec<BusMessage> {
        self.published
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RoomEventBus for MockRoomBus {
    fn instance_id(&self) -> &str {
        "mock-instance"
    }

    async fn publish(&self, message: BusMessage) -> Result<()> {
        if let Ok(mut published) = self.published.lock() {
            published.push(message);
        }
        Ok(())
    }

    fn subscribe(&self) -> BusSubscription {
        let (sender, receiver) = broadcast::channel(1);
        drop(sender);
        BusSubscription::new(receiver, self.instance_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RoomMutation;

    fn left(session: &str) -> BusMessage {
        BusMessage::Mutation(RoomMutation::MemberLeft {
            room_key: "ROOM01".to_string(),
            session_id: session.to_string(),
        })
    }

    #[tokio::test]
    async fn test_joined_buses_see_each_other_but_not_themselves() {
        let first = LocalRoomBus::new();
        let second = first.join();
        assert_ne!(first.instance_id(), second.instance_id());

        let mut first_sub = first.subscribe();
        let mut second_sub = second.subscribe();

        first.publish(left("a")).await.unwrap();
        second.publish(left("b")).await.unwrap();

        let at_second = second_sub.recv().await.unwrap();
        assert_eq!(at_second.payload, left("a"));
        assert_eq!(at_second.origin, first.instance_id());

        let at_first = first_sub.recv().await.unwrap();
        assert_eq!(at_first.payload, left("b"));
    }

    #[tokio::test]
    async fn test_standalone_publish_is_a_no_op() {
        let bus = LocalRoomBus::new();
        assert!(bus.publish(left("a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_bus_records_and_subscription_ends() {
        let bus = MockRoomBus::new();
        bus.publish(left("a")).await.unwrap();
        assert_eq!(bus.published(), vec![left("a")]);

        let mut subscription = bus.subscribe();
        assert!(subscription.recv().await.is_none());
    }
}
