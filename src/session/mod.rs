//! Session registry and lifecycle state

pub mod registry;

pub use registry::{Session, SessionCounts, SessionRegistry, SessionState};
