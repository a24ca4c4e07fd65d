//! Waiting pools for pool-based matchmaking

pub mod waiting;

pub use waiting::{LocalePool, PoolEntry, WaitingPools};
