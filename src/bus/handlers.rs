//! Handling of messages received from peer instances

use crate::bus::messages::MessageEnvelope;
use crate::bus::publisher::BusSubscription;
use crate::error::RendezvousError;
use crate::metrics::MetricsCollector;
use crate::relay::EventSink;
use crate::room::RoomDirectory;
use crate::types::BusMessage;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Applies peer mutations to the local directory and delivers forwarded events
#[derive(Clone)]
pub struct BusListener {
    directory: Arc<RoomDirectory>,
    /// Sink reaching only connections held by this instance
    local_sink: Arc<dyn EventSink>,
    metrics_collector: Arc<MetricsCollector>,
}

impl BusListener {
    pub fn new(
        directory: Arc<RoomDirectory>,
        local_sink: Arc<dyn EventSink>,
        metrics_collector: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            directory,
            local_sink,
            metrics_collector,
        }
    }

    /// Handle one peer message
    pub async fn handle(&self, envelope: MessageEnvelope) {
        match envelope.payload {
            BusMessage::Mutation(mutation) => {
                let changed = self.directory.apply_remote(&mutation);
                debug!(
                    "Applied remote mutation on {} from {} (changed: {})",
                    mutation.room_key(),
                    envelope.origin,
                    changed
                );
            }
            BusMessage::Deliver { target, event } => {
                let name = event.name();
                match self.local_sink.deliver(&target, event).await {
                    Ok(()) => self.metrics_collector.record_event_delivered(name),
                    Err(e) => match e.downcast_ref::<RendezvousError>() {
                        // Every instance sees every delivery; only the owner holds the target
                        Some(RendezvousError::UnknownTarget { .. }) => {}
                        _ => warn!("Failed to deliver forwarded {} to {}: {}", name, target, e),
                    },
                }
            }
        }
    }

    /// Consume the subscription until the bus closes
    pub async fn run(self, mut subscription: BusSubscription) {
        info!("Bus listener started");
        while let Some(envelope) = subscription.recv().await {
            self.handle(envelope).await;
        }
        info!("Bus listener stopped");
    }
}
