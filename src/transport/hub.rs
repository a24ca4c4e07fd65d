//! Outbound channels of the connections held by this instance

use crate::bus::RoomEventBus;
use crate::error::{RendezvousError, Result};
use crate::relay::EventSink;
use crate::types::{BusMessage, ServerEvent, SessionId};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Registry of live connections and their outbound queues
#[derive(Debug, Default)]
pub struct ConnectionHub {
    connections: DashMap<SessionId, mpsc::UnboundedSender<ServerEvent>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the outbound queue of a new connection
    pub fn register(&self, session_id: &str) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.connections.insert(session_id.to_string(), sender);
        debug!("Registered connection {}", session_id);
        receiver
    }

    /// Close the outbound queue of a connection
    pub fn unregister(&self, session_id: &str) -> bool {
        self.connections.remove(session_id).is_some()
    }

    pub fn is_local(&self, session_id: &str) -> bool {
        self.connections.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[async_trait]
impl EventSink for ConnectionHub {
    async fn deliver(&self, target: &str, event: ServerEvent) -> Result<()> {
        let sender = self.connections.get(target).map(|entry| entry.value().clone());
        let unknown = || RendezvousError::UnknownTarget {
            session_id: target.to_string(),
        };

        let Some(sender) = sender else {
            return Err(unknown().into());
        };
        if sender.send(event).is_err() {
            // Writer task is gone; the connection is closing
            self.connections.remove(target);
            return Err(unknown().into());
        }
        Ok(())
    }
}

/// Sink that reaches sessions connected to any instance
///
/// Local targets go straight to their connection. Everything else is handed
/// to the bus, where the owning instance picks it up.
pub struct ForwardingSink {
    hub: Arc<ConnectionHub>,
    bus: Option<Arc<dyn RoomEventBus>>,
}

impl ForwardingSink {
    pub fn new(hub: Arc<ConnectionHub>, bus: Option<Arc<dyn RoomEventBus>>) -> Self {
        Self { hub, bus }
    }

    /// Sink for a standalone instance, where non-local targets do not exist
    pub fn local(hub: Arc<ConnectionHub>) -> Self {
        Self::new(hub, None)
    }
}

#[async_trait]
impl EventSink for ForwardingSink {
    async fn deliver(&self, target: &str, event: ServerEvent) -> Result<()> {
        if self.hub.is_local(target) {
            return self.hub.deliver(target, event).await;
        }

        match &self.bus {
            Some(bus) => {
                bus.publish(BusMessage::Deliver {
                    target: target.to_string(),
                    event,
                })
                .await
            }
            None => Err(RendezvousError::UnknownTarget {
                session_id: target.to_string(),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MockRoomBus;

    fn full(key: &str) -> ServerEvent {
        ServerEvent::RoomFull {
            room_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_hub_delivers_to_registered_connection() {
        let hub = ConnectionHub::new();
        let mut receiver = hub.register("a");

        hub.deliver("a", full("R1")).await.unwrap();
        assert_eq!(receiver.recv().await, Some(full("R1")));
        assert!(hub.deliver("b", full("R1")).await.is_err());
    }

    #[tokio::test]
    async fn test_hub_drops_closed_connection() {
        let hub = ConnectionHub::new();
        let receiver = hub.register("a");
        drop(receiver);

        let err = hub.deliver("a", full("R1")).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RendezvousError>(),
            Some(RendezvousError::UnknownTarget { .. })
        ));
        assert!(!hub.is_local("a"));
    }

    #[tokio::test]
    async fn test_forwarding_sink_routes_remote_targets_to_bus() {
        let hub = Arc::new(ConnectionHub::new());
        let mut local = hub.register("local");
        let bus = Arc::new(MockRoomBus::new());
        let sink = ForwardingSink::new(hub.clone(), Some(bus.clone()));

        sink.deliver("local", full("R1")).await.unwrap();
        sink.deliver("remote", full("R2")).await.unwrap();

        assert_eq!(local.recv().await, Some(full("R1")));
        assert_eq!(
            bus.published(),
            vec![BusMessage::Deliver {
                target: "remote".to_string(),
                event: full("R2"),
            }]
        );
    }

    #[tokio::test]
    async fn test_standalone_sink_rejects_unknown_targets() {
        let sink = ForwardingSink::local(Arc::new(ConnectionHub::new()));
        assert!(sink.deliver("nobody", full("R1")).await.is_err());
    }
}
