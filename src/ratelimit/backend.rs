//! Rate limiter trait consumed by the transport layer.

use async_trait::async_trait;

use super::segment::Segment;
use crate::error::Result;

/// Trait for rate limiter implementations.
///
/// This is the contract the HTTP layer depends on, so handlers can be
/// exercised against a stub instead of real counter tiers.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Record one event for `key` at the current time.
    async fn inc(&self, key: &str) -> Result<()>;

    /// Current count for `key` in `segment`; `None` when no tier has a record.
    async fn count(&self, key: &str, segment: Segment) -> Result<Option<u64>>;
}
