//! Rooms, the room directory and the room manager
//!
//! The directory owns membership; the manager drives session transitions
//! and the events they produce.

pub mod directory;
pub mod instance;
pub mod manager;

pub use directory::{Departure, JoinOutcome, RoomDirectory};
pub use instance::{Room, RoomSnapshot};
pub use manager::{RoomManager, RoomManagerStats};
