//! Cross-instance bus for horizontally scaled deployments
//!
//! Instances share room membership changes and forward events for sessions
//! connected elsewhere. The core only depends on the `RoomEventBus` trait.

pub mod amqp;
pub mod connection;
pub mod handlers;
pub mod messages;
pub mod publisher;

// Re-export commonly used types
pub use amqp::{AmqpRoomBus, PublisherConfig};
pub use connection::{AmqpConfig, AmqpConnection};
pub use handlers::BusListener;
pub use messages::*;
pub use publisher::{BusSubscription, LocalRoomBus, MockRoomBus, RoomEventBus};
