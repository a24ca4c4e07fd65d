//! Rendezvous - room matchmaking and signaling relay
//!
//! Sessions either wait in a per-locale pool until enough peers share an
//! activity, or join a room directly by code or public search. Peers in a
//! room exchange signaling payloads and presence events through the relay,
//! and rooms are shared across instances over an AMQP fanout exchange.

pub mod activity;
pub mod bus;
pub mod config;
pub mod error;
pub mod matchmaking;
pub mod metrics;
pub mod pool;
pub mod relay;
pub mod room;
pub mod service;
pub mod session;
pub mod transport;
pub mod types;
pub mod utils;

// Re-export commonly used types and traits
pub use error::{RendezvousError, Result};
pub use types::*;

// Re-export key components
pub use activity::{ActivityProvider, StaticActivityProvider};
pub use bus::RoomEventBus;
pub use room::{RoomDirectory, RoomManager};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
