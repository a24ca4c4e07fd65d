//! AMQP-backed room event bus
//!
//! Every instance publishes to one fanout exchange and consumes from its own
//! exclusive queue bound to it, so each instance sees every message once.

use crate::bus::connection::{AmqpConfig, AmqpConnection};
use crate::bus::messages::{instance_queue_name, MessageEnvelope};
use crate::bus::publisher::{BusSubscription, RoomEventBus, BUS_CHANNEL_CAPACITY};
use crate::error::{RendezvousError, Result};
use crate::metrics::MetricsCollector;
use crate::types::{BusMessage, InstanceId};
use amqprs::{
    channel::{
        BasicAckArguments, BasicCancelArguments, BasicConsumeArguments, BasicPublishArguments,
        Channel, ExchangeDeclareArguments, QueueBindArguments, QueueDeclareArguments,
    },
    consumer::AsyncConsumer,
    BasicProperties, Deliver,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Configuration for publishing
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 500,
        }
    }
}

/// Room event bus over a RabbitMQ fanout exchange
pub struct AmqpRoomBus {
    instance_id: InstanceId,
    exchange: String,
    connection: AmqpConnection,
    channel: Channel,
    consumer_tag: String,
    inbound: broadcast::Sender<MessageEnvelope>,
    config: PublisherConfig,
    metrics_collector: Arc<MetricsCollector>,
}

impl AmqpRoomBus {
    /// Connect, declare the exchange and this instance's queue, and start consuming
    pub async fn connect(
        amqp_config: AmqpConfig,
        exchange: &str,
        instance_id: &str,
        config: PublisherConfig,
        metrics_collector: Arc<MetricsCollector>,
    ) -> Result<Self> {
        let connection = AmqpConnection::new(amqp_config).await?;
        let channel = connection.connection().open_channel(None).await.map_err(|e| {
            RendezvousError::BusConnectionFailed {
                message: format!("Failed to open channel: {}", e),
            }
        })?;

        let (inbound, _) = broadcast::channel(BUS_CHANNEL_CAPACITY);
        let bus = Self {
            instance_id: instance_id.to_string(),
            exchange: exchange.to_string(),
            connection,
            channel,
            consumer_tag: format!("rendezvous-consumer-{}", uuid::Uuid::new_v4()),
            inbound,
            config,
            metrics_collector,
        };

        bus.setup_topology().await?;
        bus.start_consuming().await?;
        Ok(bus)
    }

    /// Declare the exchange and bind this instance's exclusive queue to it
    async fn setup_topology(&self) -> Result<()> {
        let args = ExchangeDeclareArguments::new(&self.exchange, "fanout");
        self.channel.exchange_declare(args).await.map_err(|e| {
            RendezvousError::BusConnectionFailed {
                message: format!("Failed to declare exchange {}: {}", self.exchange, e),
            }
        })?;

        let queue = instance_queue_name(&self.exchange, &self.instance_id);
        let args = QueueDeclareArguments::new(&queue)
            .exclusive(true)
            .auto_delete(true)
            .finish();
        self.channel
            .queue_declare(args)
            .await
            .map_err(|e| RendezvousError::BusConnectionFailed {
                message: format!("Failed to declare queue {}: {}", queue, e),
            })?;

        let args = QueueBindArguments::new(&queue, &self.exchange, "");
        self.channel
            .queue_bind(args)
            .await
            .map_err(|e| RendezvousError::BusConnectionFailed {
                message: format!("Failed to bind queue {}: {}", queue, e),
            })?;

        info!(
            "Bound queue '{}' to exchange '{}'",
            queue, self.exchange
        );
        Ok(())
    }

    async fn start_consuming(&self) -> Result<()> {
        let queue = instance_queue_name(&self.exchange, &self.instance_id);
        let args = BasicConsumeArguments::new(&queue, &self.consumer_tag);
        let consumer = EnvelopeConsumer {
            inbound: self.inbound.clone(),
            metrics_collector: self.metrics_collector.clone(),
        };

        self.channel
            .basic_consume(consumer, args)
            .await
            .map_err(|e| RendezvousError::BusConnectionFailed {
                message: format!("Failed to start consuming: {}", e),
            })?;

        info!("Consuming room events from queue: {}", queue);
        Ok(())
    }

    /// Publish with exponential backoff retry
    async fn publish_envelope(&self, envelope: &MessageEnvelope) -> Result<()> {
        let mut retry_count = 0;
        let mut delay = Duration::from_millis(self.config.retry_delay_ms);

        loop {
            match self.try_publish(envelope).await {
                Ok(()) => {
                    debug!(
                        "Published {} message {} to exchange {}",
                        envelope.kind(),
                        envelope.correlation_id,
                        self.exchange
                    );
                    return Ok(());
                }
                Err(e) => {
                    retry_count += 1;
                    if retry_count > self.config.max_retries {
                        error!(
                            "Failed to publish message {} after {} retries: {}",
                            envelope.correlation_id, self.config.max_retries, e
                        );
                        return Err(e);
                    }

                    warn!(
                        "Publish attempt {} failed for message {}: {}. Retrying in {:?}",
                        retry_count, envelope.correlation_id, e, delay
                    );

                    sleep(delay).await;
                    delay = Duration::from_millis((delay.as_millis() as u64 * 2).min(5000));
                }
            }
        }
    }

    /// Single publish attempt
    async fn try_publish(&self, envelope: &MessageEnvelope) -> Result<()> {
        let payload = envelope.to_bytes()?;

        let args = BasicPublishArguments::new(&self.exchange, &envelope.routing_key);
        let mut properties = BasicProperties::default();
        properties
            .with_message_id(&envelope.correlation_id)
            .with_timestamp(envelope.timestamp.timestamp() as u64)
            .with_content_type("application/json");

        self.channel
            .basic_publish(properties, payload, args)
            .await
            .map_err(|e| RendezvousError::BusConnectionFailed {
                message: format!("Failed to publish message: {}", e),
            })?;

        Ok(())
    }
}

#[async_trait]
impl RoomEventBus for AmqpRoomBus {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn publish(&self, message: BusMessage) -> Result<()> {
        let envelope = MessageEnvelope::new(message, &self.instance_id);
        match self.publish_envelope(&envelope).await {
            Ok(()) => {
                self.metrics_collector
                    .record_bus_message("published", envelope.kind());
                Ok(())
            }
            Err(e) => {
                self.metrics_collector.record_bus_error("publish");
                Err(e)
            }
        }
    }

    fn subscribe(&self) -> BusSubscription {
        BusSubscription::new(self.inbound.subscribe(), &self.instance_id)
    }

    fn is_connected(&self) -> bool {
        self.connection.is_alive() && self.channel.is_open()
    }

    async fn shutdown(&self) -> Result<()> {
        let args = BasicCancelArguments::new(&self.consumer_tag);
        if let Err(e) = self.channel.basic_cancel(args).await {
            warn!("Failed to cancel bus consumer: {}", e);
        }
        self.connection.close().await?;
        info!("Closed bus connection for instance {}", self.instance_id);
        Ok(())
    }
}

/// Forwards consumed envelopes into the in-process fan-out channel
struct EnvelopeConsumer {
    inbound: broadcast::Sender<MessageEnvelope>,
    metrics_collector: Arc<MetricsCollector>,
}

#[async_trait]
impl AsyncConsumer for EnvelopeConsumer {
    async fn consume(
        &mut self,
        channel: &Channel,
        deliver: Deliver,
        _basic_properties: BasicProperties,
        content: Vec<u8>,
    ) {
        let delivery_tag = deliver.delivery_tag();

        match MessageEnvelope::from_bytes(&content) {
            Ok(envelope) => {
                debug!(
                    "Bus message received - delivery_tag: {}, kind: {}, origin: {}",
                    delivery_tag,
                    envelope.kind(),
                    envelope.origin
                );
                self.metrics_collector
                    .record_bus_message("received", envelope.kind());
                // No subscribers only happens during shutdown
                let _ = self.inbound.send(envelope);
            }
            Err(e) => {
                self.metrics_collector.record_bus_error("decode");
                warn!(
                    "Discarding undecodable bus message - delivery_tag: {}, size: {} bytes, error: {}",
                    delivery_tag,
                    content.len(),
                    e
                );
            }
        }

        if let Err(e) = channel
            .basic_ack(BasicAckArguments::new(delivery_tag, false))
            .await
        {
            self.metrics_collector.record_bus_error("ack");
            error!("Failed to ack bus message {}: {}", delivery_tag, e);
        }
    }
}
