//! Per-locale waiting pools
//!
//! Each locale owns its own mutex so that enqueue, dequeue and the
//! matchmaking commit of different locales never contend. Every entry carries
//! a ticket that changes whenever the session re-enqueues, which lets a commit
//! detect entries that were replaced after its snapshot was taken.

use crate::error::{RendezvousError, Result};
use crate::types::{Locale, SessionId};
use crate::utils::current_timestamp;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// A session waiting for pool matching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEntry {
    pub session_id: SessionId,
    pub display_name: String,
    /// Activities the session is eligible for, already resolved against the catalog
    pub activities: Vec<String>,
    pub ticket: u64,
    pub enqueued_at: DateTime<Utc>,
}

/// Waiting sessions of one locale, in enqueue order
#[derive(Debug, Default)]
pub struct LocalePool {
    entries: Vec<PoolEntry>,
}

impl LocalePool {
    /// Add an entry, replacing any previous entry of the same session
    pub fn push(&mut self, entry: PoolEntry) {
        self.entries.retain(|e| e.session_id != entry.session_id);
        self.entries.push(entry);
    }

    pub fn remove(&mut self, session_id: &str) -> Option<PoolEntry> {
        let idx = self.entries.iter().position(|e| e.session_id == session_id)?;
        Some(self.entries.remove(idx))
    }

    /// Whether the session is still pooled under the given ticket
    pub fn holds(&self, session_id: &str, ticket: u64) -> bool {
        self.entries
            .iter()
            .any(|e| e.session_id == session_id && e.ticket == ticket)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.entries.iter().any(|e| e.session_id == session_id)
    }

    pub fn entries(&self) -> &[PoolEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All waiting pools of this instance, keyed by locale
///
/// Locale pools are created lazily and never dropped, so a handle cloned out
/// of the map always refers to the live pool.
#[derive(Debug, Default)]
pub struct WaitingPools {
    pools: DashMap<Locale, Arc<Mutex<LocalePool>>>,
    next_ticket: AtomicU64,
}

impl WaitingPools {
    pub fn new() -> Self {
        Self::default()
    }

    fn pool(&self, locale: &str) -> Arc<Mutex<LocalePool>> {
        if let Some(pool) = self.pools.get(locale) {
            return Arc::clone(pool.value());
        }
        Arc::clone(
            self.pools
                .entry(locale.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(LocalePool::default())))
                .value(),
        )
    }

    /// Put a session into the pool of `locale` and return its new ticket
    pub fn enqueue(
        &self,
        locale: &str,
        session_id: &str,
        display_name: &str,
        activities: Vec<String>,
    ) -> Result<u64> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = PoolEntry {
            session_id: session_id.to_string(),
            display_name: display_name.to_string(),
            activities,
            ticket,
            enqueued_at: current_timestamp(),
        };

        self.with_pool(locale, |pool| pool.push(entry))?;
        debug!(
            "Session {} waiting in locale '{}' with ticket {}",
            session_id, locale, ticket
        );
        Ok(ticket)
    }

    /// Remove a session from the pool of `locale`
    pub fn remove(&self, locale: &str, session_id: &str) -> Result<Option<PoolEntry>> {
        if !self.pools.contains_key(locale) {
            return Ok(None);
        }
        self.with_pool(locale, |pool| pool.remove(session_id))
    }

    /// Copy of the current entries of `locale`, in enqueue order
    pub fn snapshot(&self, locale: &str) -> Result<Vec<PoolEntry>> {
        if !self.pools.contains_key(locale) {
            return Ok(Vec::new());
        }
        self.with_pool(locale, |pool| pool.entries().to_vec())
    }

    /// Run `f` while holding the lock of the locale pool
    pub fn with_pool<T>(&self, locale: &str, f: impl FnOnce(&mut LocalePool) -> T) -> Result<T> {
        let pool = self.pool(locale);
        let mut guard = pool
            .lock()
            .map_err(|_| RendezvousError::lock_failed("waiting pool"))?;
        Ok(f(&mut guard))
    }

    /// Number of sessions waiting in `locale`
    pub fn waiting_in(&self, locale: &str) -> usize {
        self.snapshot(locale).map(|s| s.len()).unwrap_or(0)
    }

    /// Number of sessions waiting across all locales
    pub fn total_waiting(&self) -> usize {
        let pools: Vec<Arc<Mutex<LocalePool>>> =
            self.pools.iter().map(|p| Arc::clone(p.value())).collect();
        pools
            .iter()
            .filter_map(|pool| pool.lock().ok().map(|guard| guard.len()))
            .sum()
    }

    /// Locales that currently have at least one waiting session
    pub fn active_locales(&self) -> Vec<Locale> {
        let pools: Vec<(Locale, Arc<Mutex<LocalePool>>)> = self
            .pools
            .iter()
            .map(|p| (p.key().clone(), Arc::clone(p.value())))
            .collect();
        pools
            .into_iter()
            .filter(|(_, pool)| pool.lock().map(|g| !g.is_empty()).unwrap_or(false))
            .map(|(locale, _)| locale)
            .collect()
    }
}
