//! Orchestration of the fast and durable counter tiers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, instrument, trace, warn};

use super::backend::RateLimiterBackend;
use super::segment::Segment;
use crate::clock::Clock;
use crate::config::ServiceConfig;
use crate::error::{Result, StorageError};
use crate::store::CounterStore;

/// Rate limit accounting over two counter tiers.
///
/// Writes land in the fast tier synchronously and are copied to the
/// durable tier in the background. Reads take the fast tier's answer when
/// it has one and fall back to the durable tier otherwise; the two are
/// never summed.
pub struct RateLimitService {
    fast: Arc<dyn CounterStore>,
    durable: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    /// Upper bound for each background durable write
    durable_write_timeout: Duration,
    /// In-flight durable writes, drained at shutdown
    durable_writes: TaskTracker,
    /// Runtime the durable writes are spawned on
    runtime: Handle,
}

impl std::fmt::Debug for RateLimitService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitService")
            .field("clock", &self.clock)
            .field("durable_write_timeout", &self.durable_write_timeout)
            .field("pending_durable_writes", &self.durable_writes.len())
            .finish()
    }
}

impl RateLimitService {
    /// Create a service over the given tiers.
    ///
    /// Background durable writes run on the runtime this is called from,
    /// independently of whichever task later calls [`inc`](Self::inc).
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(
        fast: Arc<dyn CounterStore>,
        durable: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        config: &ServiceConfig,
    ) -> Self {
        Self {
            fast,
            durable,
            clock,
            durable_write_timeout: config.durable_write_timeout(),
            durable_writes: TaskTracker::new(),
            runtime: Handle::current(),
        }
    }

    /// Record one event for `key` in the current second.
    ///
    /// Only a fast-tier failure is returned; the durable write is
    /// best-effort and its outcome is logged.
    #[instrument(skip(self))]
    pub async fn inc(&self, key: &str) -> Result<()> {
        let bucket = self.clock.now();

        self.fast.inc(key, bucket).await?;
        self.spawn_durable_write(key, bucket);

        debug!(bucket, "Recorded event");
        Ok(())
    }

    /// Current count for `key` in `segment`.
    ///
    /// `Ok(None)` means neither tier has a record.
    #[instrument(skip(self))]
    pub async fn count(&self, key: &str, segment: Segment) -> Result<Option<u64>> {
        match segment {
            Segment::Second => {
                let bucket = self.clock.now();
                if let Some(count) = fast_hit(key, segment, self.fast.count(key, bucket).await) {
                    return Ok(Some(count));
                }
                Ok(self.durable.count(key, bucket).await?)
            }
            Segment::Hour => {
                if let Some(count) = fast_hit(key, segment, self.fast.count_all(key).await) {
                    return Ok(Some(count));
                }
                Ok(self.durable.count_all(key).await?)
            }
        }
    }

    /// Like [`count`](Self::count), with the segment given by name.
    ///
    /// An unknown name fails before either tier is consulted.
    pub async fn count_segment(&self, key: &str, segment: &str) -> Result<Option<u64>> {
        let segment: Segment = segment.parse()?;
        self.count(key, segment).await
    }

    /// Number of durable writes still in flight.
    pub fn pending_durable_writes(&self) -> usize {
        self.durable_writes.len()
    }

    /// Wait up to `grace` for in-flight durable writes to finish.
    ///
    /// Returns `false` if some were still running when the grace period ran out.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.drain_until(Instant::now() + grace).await
    }

    /// Wait until `deadline` for in-flight durable writes to finish.
    ///
    /// A deadline already in the past still closes the tracker and reports
    /// whatever is left.
    pub async fn drain_until(&self, deadline: Instant) -> bool {
        self.durable_writes.close();
        let drained = tokio::time::timeout_at(deadline, self.durable_writes.wait())
            .await
            .is_ok();

        if !drained {
            warn!(
                pending = self.durable_writes.len(),
                "Durable writes still pending after grace period"
            );
        }
        drained
    }

    fn spawn_durable_write(&self, key: &str, bucket: i64) {
        let durable = Arc::clone(&self.durable);
        let key = key.to_string();
        let limit = self.durable_write_timeout;

        self.durable_writes.spawn_on(
            async move {
                match tokio::time::timeout(limit, durable.inc(&key, bucket)).await {
                    Ok(Ok(())) => trace!(key = %key, bucket, "Durable write completed"),
                    Ok(Err(e)) => warn!(key = %key, bucket, error = %e, "Durable write failed"),
                    Err(_) => warn!(
                        key = %key,
                        bucket,
                        timeout_ms = limit.as_millis() as u64,
                        "Durable write timed out"
                    ),
                }
            },
            &self.runtime,
        );
    }
}

/// The fast tier's answer, if it has one worth returning.
fn fast_hit(
    key: &str,
    segment: Segment,
    result: std::result::Result<Option<u64>, StorageError>,
) -> Option<u64> {
    match result {
        Ok(Some(count)) => Some(count),
        Ok(None) => {
            debug!(key = %key, segment = ?segment, "Fast tier miss, reading durable tier");
            None
        }
        Err(e) => {
            warn!(
                key = %key,
                segment = ?segment,
                error = %e,
                "Fast tier read failed, reading durable tier"
            );
            None
        }
    }
}

#[async_trait]
impl RateLimiterBackend for RateLimitService {
    async fn inc(&self, key: &str) -> Result<()> {
        RateLimitService::inc(self, key).await
    }

    async fn count(&self, key: &str, segment: Segment) -> Result<Option<u64>> {
        RateLimitService::count(self, key, segment).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::config::{EvictionPolicy, FastTierConfig};
    use crate::error::ArlError;
    use crate::store::testing::StubStore;
    use crate::store::FastCounter;

    const NOW: i64 = 1_700_000_000;
    const DRAIN: Duration = Duration::from_secs(2);

    struct Harness {
        service: RateLimitService,
        fast: Arc<FastCounter>,
        durable: Arc<StubStore>,
        clock: FakeClock,
    }

    fn harness_with(durable: StubStore) -> Harness {
        let clock = FakeClock::new(NOW);
        let fast = Arc::new(FastCounter::new(
            &FastTierConfig {
                retention_secs: 60,
                sweep_interval_ms: 3000,
                eviction: EvictionPolicy::Key,
            },
            Arc::new(clock.clone()),
        ));
        let durable = Arc::new(durable);
        let service = RateLimitService::new(
            fast.clone(),
            durable.clone(),
            Arc::new(clock.clone()),
            &ServiceConfig::default(),
        );
        Harness {
            service,
            fast,
            durable,
            clock,
        }
    }

    fn harness() -> Harness {
        harness_with(StubStore::new())
    }

    fn stub_service(fast: Arc<StubStore>, durable: Arc<StubStore>) -> RateLimitService {
        RateLimitService::new(
            fast,
            durable,
            Arc::new(FakeClock::new(NOW)),
            &ServiceConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_inc_then_count_same_second() {
        let h = harness();

        h.service.inc("alice").await.unwrap();

        assert_eq!(h.service.count("alice", Segment::Second).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_n_increments_count_n_in_both_tiers() {
        let h = harness();

        for _ in 0..7 {
            h.service.inc("alice").await.unwrap();
        }
        assert!(h.service.drain(DRAIN).await);

        assert_eq!(h.service.count("alice", Segment::Second).await.unwrap(), Some(7));
        assert_eq!(h.durable.get("alice", NOW), Some(7));
        assert_eq!(h.durable.inc_calls(), 7);
    }

    #[tokio::test]
    async fn test_second_count_uses_current_bucket() {
        let h = harness();
        h.service.inc("alice").await.unwrap();
        assert!(h.service.drain(DRAIN).await);

        h.clock.advance(1);

        // Neither tier has the new bucket.
        assert_eq!(h.service.count("alice", Segment::Second).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_known_key_new_bucket_falls_back_to_durable() {
        let h = harness();
        h.service.inc("alice").await.unwrap();
        assert!(h.service.drain(DRAIN).await);

        // Another instance recorded the next second; this one only holds NOW.
        h.clock.advance(1);
        h.durable.seed("alice", NOW + 1, 4);

        assert_eq!(h.fast.bucket_count("alice"), 1);
        assert_eq!(h.service.count("alice", Segment::Second).await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_hour_sums_all_fast_buckets() {
        let h = harness();

        h.service.inc("alice").await.unwrap();
        h.clock.advance(10);
        h.service.inc("alice").await.unwrap();
        h.service.inc("alice").await.unwrap();

        assert_eq!(h.service.count("alice", Segment::Hour).await.unwrap(), Some(3));
        assert_eq!(h.service.count("alice", Segment::Second).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_unknown_key_is_absent_not_zero() {
        let h = harness();

        assert_eq!(h.service.count("bob", Segment::Second).await.unwrap(), None);
        assert_eq!(h.service.count("bob", Segment::Hour).await.unwrap(), None);
        assert_eq!(h.durable.read_calls(), 2);
    }

    #[tokio::test]
    async fn test_fast_miss_falls_back_to_durable() {
        let h = harness();
        h.durable.seed("alice", NOW, 4);
        h.durable.seed("alice", NOW - 30, 5);

        assert_eq!(h.service.count("alice", Segment::Second).await.unwrap(), Some(4));
        assert_eq!(h.service.count("alice", Segment::Hour).await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn test_fast_hit_is_not_merged_with_durable() {
        let h = harness();
        h.durable.seed("alice", NOW, 5);

        h.service.inc("alice").await.unwrap();
        h.service.inc("alice").await.unwrap();

        assert_eq!(h.service.count("alice", Segment::Second).await.unwrap(), Some(2));
        assert_eq!(h.service.count("alice", Segment::Hour).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_evicted_key_falls_back_to_durable() {
        let h = harness();
        for _ in 0..3 {
            h.service.inc("alice").await.unwrap();
        }
        assert!(h.service.drain(DRAIN).await);

        h.clock.advance(61);
        h.fast.sweep();
        assert_eq!(h.fast.key_count(), 0);

        assert_eq!(h.service.count("alice", Segment::Hour).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_unknown_segment_touches_no_tier() {
        let fast = Arc::new(StubStore::new());
        let durable = Arc::new(StubStore::new());
        let service = stub_service(fast.clone(), durable.clone());

        let result = service.count_segment("alice", "minute").await;

        assert!(matches!(result, Err(ArlError::UnknownSegment(s)) if s == "minute"));
        assert_eq!(fast.read_calls() + fast.inc_calls(), 0);
        assert_eq!(durable.read_calls() + durable.inc_calls(), 0);
    }

    #[tokio::test]
    async fn test_count_segment_by_name() {
        let h = harness();
        h.service.inc("alice").await.unwrap();

        assert_eq!(h.service.count_segment("alice", "second").await.unwrap(), Some(1));
        assert_eq!(h.service.count_segment("alice", "hour").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_fast_write_failure_skips_durable_write() {
        let fast = Arc::new(StubStore::failing());
        let durable = Arc::new(StubStore::new());
        let service = stub_service(fast, durable.clone());

        let result = service.inc("alice").await;
        assert!(matches!(result, Err(ArlError::Storage(_))));

        assert!(service.drain(DRAIN).await);
        assert_eq!(durable.inc_calls(), 0);
    }

    #[tokio::test]
    async fn test_durable_write_failure_is_swallowed() {
        let h = harness_with(StubStore::failing());

        tokio_test::assert_ok!(h.service.inc("alice").await);
        assert!(h.service.drain(DRAIN).await);

        assert_eq!(h.durable.inc_calls(), 1);
        assert_eq!(h.service.count("alice", Segment::Second).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_slow_durable_write_does_not_delay_caller() {
        let clock = FakeClock::new(NOW);
        let fast = Arc::new(StubStore::new());
        let durable = Arc::new(StubStore::slow(Duration::from_secs(30)));
        let service = RateLimitService::new(
            fast,
            durable.clone(),
            Arc::new(clock),
            &ServiceConfig {
                durable_write_timeout_ms: 50,
            },
        );

        let started = std::time::Instant::now();
        service.inc("alice").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(service.pending_durable_writes(), 1);

        // The write gives up at its own timeout, well inside the drain window.
        assert!(service.drain(DRAIN).await);
        assert_eq!(service.pending_durable_writes(), 0);
        assert_eq!(durable.get("alice", NOW), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_until_stops_at_shared_deadline() {
        let durable = Arc::new(StubStore::slow(Duration::from_secs(30)));
        let service = RateLimitService::new(
            Arc::new(StubStore::new()),
            durable,
            Arc::new(FakeClock::new(NOW)),
            &ServiceConfig {
                durable_write_timeout_ms: 10_000,
            },
        );
        service.inc("alice").await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(1);
        // Earlier shutdown work spends most of the budget.
        tokio::time::sleep(Duration::from_millis(800)).await;

        assert!(!service.drain_until(deadline).await);
        assert_eq!(Instant::now(), deadline);
        assert_eq!(service.pending_durable_writes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_until_past_deadline_returns_immediately() {
        let service = stub_service(
            Arc::new(StubStore::new()),
            Arc::new(StubStore::slow(Duration::from_secs(30))),
        );
        service.inc("alice").await.unwrap();

        let started = Instant::now();
        assert!(!service.drain_until(started - Duration::from_millis(1)).await);
        assert_eq!(Instant::now(), started);
    }

    #[tokio::test]
    async fn test_durable_error_after_fallback_is_surfaced() {
        let fast = Arc::new(StubStore::new());
        let durable = Arc::new(StubStore::failing());
        let service = stub_service(fast, durable);

        let result = service.count("alice", Segment::Hour).await;
        assert!(matches!(result, Err(ArlError::Storage(_))));
    }

    #[tokio::test]
    async fn test_fast_read_error_falls_back_to_durable() {
        let fast = Arc::new(StubStore::failing());
        let durable = Arc::new(StubStore::new());
        durable.seed("alice", NOW, 6);
        let service = stub_service(fast, durable);

        assert_eq!(service.count("alice", Segment::Second).await.unwrap(), Some(6));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_inc_loses_no_updates() {
        let h = harness();
        let service = Arc::new(h.service);

        let tasks = (0..8).map(|_| {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                for _ in 0..100 {
                    service.inc("shared").await.unwrap();
                }
            })
        });
        for result in futures::future::join_all(tasks).await {
            result.unwrap();
        }
        assert!(service.drain(DRAIN).await);

        assert_eq!(h.fast.count("shared", NOW).await.unwrap(), Some(800));
        assert_eq!(h.durable.get("shared", NOW), Some(800));
    }

    #[tokio::test]
    async fn test_quota_exceeded_after_eleven_events() {
        let h = harness();
        let quota = 10;

        for _ in 0..11 {
            h.service.inc("carol").await.unwrap();
        }

        let count = h.service.count("carol", Segment::Second).await.unwrap();
        assert!(count.is_some_and(|c| c > quota));
    }

    #[tokio::test]
    async fn test_backend_trait_delegates() {
        let h = harness();
        let backend: &dyn RateLimiterBackend = &h.service;

        backend.inc("alice").await.unwrap();
        assert_eq!(backend.count("alice", Segment::Second).await.unwrap(), Some(1));
    }
}
