//! Serialized scheduling of matchmaking passes
//!
//! Pool changes trigger a pass for their locale. Triggers for a locale that
//! already has a pass queued coalesce into it, and a single worker runs the
//! passes one at a time.

use crate::error::RendezvousError;
use crate::matchmaking::engine::MatchmakingEngine;
use crate::types::Locale;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Handle used to request matchmaking passes
#[derive(Clone)]
pub struct MatchScheduler {
    sender: mpsc::UnboundedSender<Locale>,
    pending: Arc<Mutex<HashSet<Locale>>>,
}

impl MatchScheduler {
    /// Create a scheduler and the worker that executes its passes
    pub fn new(engine: Arc<MatchmakingEngine>) -> (Self, MatchWorker) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let scheduler = Self {
            sender,
            pending: Arc::new(Mutex::new(HashSet::new())),
        };
        let worker = MatchWorker {
            engine,
            scheduler: scheduler.clone(),
            receiver,
        };
        (scheduler, worker)
    }

    /// Request a pass for `locale`
    ///
    /// Returns false when a pass for the locale is already queued.
    pub fn trigger(&self, locale: &str) -> bool {
        let mut pending = match self.pending.lock() {
            Ok(pending) => pending,
            Err(_) => {
                error!("{}", RendezvousError::lock_failed("match scheduler"));
                return false;
            }
        };
        if !pending.insert(locale.to_string()) {
            return false;
        }
        if self.sender.send(locale.to_string()).is_err() {
            pending.remove(locale);
            warn!("Match worker stopped, dropping trigger for '{}'", locale);
            return false;
        }
        true
    }

    /// Number of locales with a queued pass
    pub fn pending(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    fn started(&self, locale: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(locale);
        }
    }
}

/// Runs queued passes one at a time
pub struct MatchWorker {
    engine: Arc<MatchmakingEngine>,
    scheduler: MatchScheduler,
    receiver: mpsc::UnboundedReceiver<Locale>,
}

impl MatchWorker {
    /// Process triggers until every scheduler handle is dropped
    pub async fn run(mut self) {
        info!("Match worker started");
        while let Some(locale) = self.receiver.recv().await {
            self.process(&locale).await;
        }
        info!("Match worker stopped");
    }

    /// Run every pass queued so far, including retries they request
    pub async fn drain(&mut self) -> usize {
        let mut passes = 0;
        while let Ok(locale) = self.receiver.try_recv() {
            self.process(&locale).await;
            passes += 1;
        }
        passes
    }

    async fn process(&self, locale: &str) {
        // Triggers arriving from here on queue another pass
        self.scheduler.started(locale);

        match self.engine.run_matching_pass(locale).await {
            Ok(outcome) if outcome.needs_retry => {
                debug!("Pass for '{}' abandoned a group, retrying", locale);
                self.scheduler.trigger(locale);
            }
            Ok(_) => {}
            Err(e) => error!("Matching pass for '{}' failed: {}", locale, e),
        }
    }
}
