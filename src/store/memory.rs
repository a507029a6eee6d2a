//! In-process counter tier with background eviction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::CounterStore;
use crate::clock::Clock;
use crate::config::{EvictionPolicy, FastTierConfig};
use crate::error::StorageError;

/// Per-key mapping from timestamp bucket to count.
type Buckets = HashMap<i64, u64>;

/// The fast counter tier.
///
/// A single reader/writer lock guards the whole key space: `inc` and the
/// sweep take it exclusively, reads share it. No operation awaits while
/// holding it.
#[derive(Debug)]
pub struct FastCounter {
    /// Counters indexed by key, then by bucket
    counters: RwLock<HashMap<String, Buckets>>,
    /// Age in seconds beyond which a bucket is stale
    retention_secs: i64,
    eviction: EvictionPolicy,
    clock: Arc<dyn Clock>,
}

impl FastCounter {
    /// Create a counter without a background sweep.
    pub fn new(config: &FastTierConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            retention_secs: i64::try_from(config.retention_secs).unwrap_or(i64::MAX),
            eviction: config.eviction,
            clock,
        }
    }

    /// Create a counter and start its sweep, which runs until `shutdown` is cancelled.
    pub fn spawn(
        config: &FastTierConfig,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, Sweeper) {
        let counter = Arc::new(Self::new(config, clock));
        let sweeper = Sweeper::start(Arc::clone(&counter), config.sweep_interval(), shutdown);
        (counter, sweeper)
    }

    /// Evict stale data as of the clock's current time.
    ///
    /// Returns the number of buckets removed.
    pub fn sweep(&self) -> usize {
        let horizon = self.clock.now().saturating_sub(self.retention_secs);
        let is_stale = |bucket: &i64| *bucket < horizon;
        let mut evicted = 0;

        let mut counters = self.counters.write();
        match self.eviction {
            EvictionPolicy::Key => counters.retain(|_, buckets| {
                if buckets.keys().any(is_stale) {
                    evicted += buckets.len();
                    false
                } else {
                    true
                }
            }),
            EvictionPolicy::Bucket => counters.retain(|_, buckets| {
                let before = buckets.len();
                buckets.retain(|bucket, _| !is_stale(bucket));
                evicted += before - buckets.len();
                !buckets.is_empty()
            }),
        }

        evicted
    }

    /// Number of keys currently held.
    pub fn key_count(&self) -> usize {
        self.counters.read().len()
    }

    /// Number of buckets currently held for a key.
    pub fn bucket_count(&self, key: &str) -> usize {
        self.counters.read().get(key).map_or(0, HashMap::len)
    }
}

#[async_trait]
impl CounterStore for FastCounter {
    async fn inc(&self, key: &str, bucket: i64) -> Result<(), StorageError> {
        let mut counters = self.counters.write();
        let count = counters
            .entry(key.to_string())
            .or_default()
            .entry(bucket)
            .or_insert(0);
        *count += 1;

        trace!(key = %key, bucket, count = *count, "Incremented fast counter");
        Ok(())
    }

    async fn count(&self, key: &str, bucket: i64) -> Result<Option<u64>, StorageError> {
        let counters = self.counters.read();
        Ok(counters.get(key).and_then(|buckets| buckets.get(&bucket)).copied())
    }

    async fn count_all(&self, key: &str) -> Result<Option<u64>, StorageError> {
        let counters = self.counters.read();
        Ok(counters.get(key).map(|buckets| buckets.values().sum()))
    }
}

/// Handle to the background task that evicts stale fast-tier data.
#[derive(Debug)]
pub struct Sweeper {
    handle: JoinHandle<()>,
}

impl Sweeper {
    fn start(counter: Arc<FastCounter>, period: Duration, shutdown: CancellationToken) -> Self {
        info!(
            period_ms = period.as_millis() as u64,
            retention_secs = counter.retention_secs,
            eviction = ?counter.eviction,
            "Starting fast counter sweep"
        );

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = counter.sweep();
                        if evicted > 0 {
                            debug!(evicted, keys = counter.key_count(), "Swept stale buckets");
                        }
                    }
                }
            }

            info!("Fast counter sweep stopped");
        });

        Self { handle }
    }

    /// Wait for the sweep task to exit after its shutdown token was cancelled.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Fast counter sweep task failed");
        }
    }
}
