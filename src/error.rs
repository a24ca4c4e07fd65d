//! Error types for the rendezvous service
//!
//! Propagation uses anyhow throughout; `RendezvousError` names the domain
//! failures callers may want to downcast and react to.

/// Result type alias for convenience
pub type Result<T> = anyhow::Result<T>;

/// Custom error types for specific room and relay scenarios
#[derive(Debug, thiserror::Error)]
pub enum RendezvousError {
    #[error("Room is full: {room_key}")]
    RoomFull { room_key: String },

    #[error("Unknown relay target: {session_id}")]
    UnknownTarget { session_id: String },

    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Invalid command: {reason}")]
    InvalidCommand { reason: String },

    #[error("Bus connection failed: {message}")]
    BusConnectionFailed { message: String },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Internal service error: {message}")]
    InternalError { message: String },
}

impl RendezvousError {
    /// Shorthand for a poisoned or unavailable lock
    pub fn lock_failed(what: &str) -> Self {
        RendezvousError::InternalError {
            message: format!("Failed to acquire {} lock", what),
        }
    }
}
