//! Background expiration sweep
//!
//! Lookups already reclaim stale entries lazily; the sweeper bounds how long an
//! expired entry that nobody asks for keeps holding memory or disk.

use crate::cache::QueryCache;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Periodically evicts expired and invalidated entries
#[derive(Debug)]
pub struct ExpirationSweeper {
    handle: JoinHandle<()>,
    period: Duration,
}

impl ExpirationSweeper {
    /// Start sweeping `cache` every `period`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(cache: Arc<QueryCache>, period: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let removed = cache.evict_expired();
                if removed > 0 {
                    debug!("Expiration sweep removed {} entries", removed);
                }
            }
        });
        info!("Started result cache sweeper every {:?}", period);

        Self { handle, period }
    }

    /// Start sweeping at the cache's configured interval
    pub fn for_cache(cache: Arc<QueryCache>) -> Self {
        let period = cache.config().sweep_interval;
        Self::spawn(cache, period)
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop sweeping
    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for ExpirationSweeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
