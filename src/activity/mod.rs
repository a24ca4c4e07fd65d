//! Activity catalog for pool-based matchmaking
//!
//! Activities carry the capacity bounds matched rooms inherit.

pub mod provider;

pub use provider::{ActivityConfiguration, ActivityProvider, StaticActivityProvider};
