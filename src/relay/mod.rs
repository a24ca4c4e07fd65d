//! Presence and signaling relay

pub mod presence;
pub mod sink;

pub use presence::PresenceRelay;
pub use sink::{EventSink, MockEventSink};
