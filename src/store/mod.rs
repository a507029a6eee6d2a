//! Counter storage tiers.
//!
//! Both tiers implement [`CounterStore`]: the in-process [`FastCounter`]
//! and the Redis-backed [`DurableCounter`]. The service layer only ever
//! sees the trait.

pub mod durable;
pub mod memory;

use async_trait::async_trait;

use crate::error::StorageError;

pub use self::durable::DurableCounter;
pub use self::memory::{FastCounter, Sweeper};

/// Per-key, per-bucket counting.
///
/// Reads return `Ok(None)` when the tier has no record of the key (or of
/// the bucket), which is distinct from a recorded zero.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter for `(key, bucket)` by one, creating it if absent.
    async fn inc(&self, key: &str, bucket: i64) -> Result<(), StorageError>;

    /// Counter value for exactly this bucket.
    async fn count(&self, key: &str, bucket: i64) -> Result<Option<u64>, StorageError>;

    /// Sum of every bucket this tier holds for the key.
    async fn count_all(&self, key: &str) -> Result<Option<u64>, StorageError>;
}
