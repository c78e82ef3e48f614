//! Active expiration.
//!
//! Lookups already drop expired entries lazily. The reaper additionally
//! walks the store on a period of at most a tenth of the shortest lifespan
//! stored so far and evicts expired entries in small batches, yielding
//! between batches.

use crate::cache::storage::EntryStore;
use crate::config::ExpirationConfig;
use crate::types::now_ms;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Floor for the reaper period, so tiny lifespans don't spin the reaper.
const MIN_REAPER_PERIOD: Duration = Duration::from_millis(10);

/// Effective reaper period: `min(reaper_interval, lifespan / 10)`.
pub fn reaper_period(config: &ExpirationConfig, lifespan: Duration) -> Duration {
    config
        .reaper_interval
        .min(lifespan / 10)
        .max(MIN_REAPER_PERIOD)
}

/// Periodic sweeper of expired entries.
pub struct Reaper {
    store: Arc<EntryStore>,
    config: ExpirationConfig,
    batch_size: usize,
    /// Default lifespan of the cache.
    lifespan: Duration,
}

impl Reaper {
    /// Create a reaper for `store`.
    pub fn new(store: Arc<EntryStore>, config: &ExpirationConfig, lifespan: Duration) -> Self {
        Self {
            store,
            config: config.clone(),
            batch_size: config.batch_size.max(1),
            lifespan,
        }
    }

    /// Period until the next sweep, shortened by any shorter per-entry
    /// lifespan stored since the last one.
    fn next_period(&self) -> Duration {
        let lifespan = match self.store.shortest_lifespan() {
            Some(shortest) => shortest.min(self.lifespan),
            None => self.lifespan,
        };
        reaper_period(&self.config, lifespan)
    }

    /// Evict every entry expired as of now, calling `on_expired` for each.
    /// Returns the number evicted.
    pub async fn sweep<F>(&self, mut on_expired: F) -> usize
    where
        F: FnMut(&str),
    {
        let now = now_ms();
        let candidates = self.store.expired_keys(now);
        let mut evicted = 0;
        for batch in candidates.chunks(self.batch_size) {
            for key in batch {
                // Skip keys rewritten since the scan.
                if self.store.evict_if_expired(key, now) {
                    evicted += 1;
                    on_expired(key);
                }
            }
            tokio::task::yield_now().await;
        }
        evicted
    }

    /// Sweep every period until `shutdown` fires.
    pub async fn run<F>(self, shutdown: CancellationToken, mut on_expired: F)
    where
        F: FnMut(&str) + Send,
    {
        let mut period = self.next_period();
        debug!(period_ms = period.as_millis() as u64, "Expiration reaper started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(period) => {
                    let evicted = self.sweep(&mut on_expired).await;
                    if evicted > 0 {
                        trace!(evicted, "Reaped expired entries");
                    }
                }
            }
            let next = self.next_period();
            if next != period {
                debug!(period_ms = next.as_millis() as u64, "Reaper period changed");
                period = next;
            }
        }
        debug!("Expiration reaper stopped");
    }
}
