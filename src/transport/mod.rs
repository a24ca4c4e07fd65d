//! Client transport
//!
//! WebSocket connections feed commands into the room manager; the connection
//! hub is the event sink the relay writes to.

pub mod hub;
pub mod ws;

pub use hub::{ConnectionHub, ForwardingSink};
pub use ws::{parse_command, router, TransportState};
