//! Pool-based matchmaking
//!
//! Groups waiting sessions of one locale into rooms sized by their activity.

pub mod engine;
pub mod scheduler;

pub use engine::{plan_groups, FormedRoom, MatchmakingEngine, PassOutcome, PlannedGroup};
pub use scheduler::{MatchScheduler, MatchWorker};
