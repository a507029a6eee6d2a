//! Redis-backed counter tier.
//!
//! Each rate-limited key maps to one Redis hash whose fields are timestamp
//! buckets and whose values are counts. The hash gets an expiry when it is
//! first created, so idle keys disappear on their own.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, trace};

use super::CounterStore;
use crate::config::DurableConfig;
use crate::error::StorageError;

/// Name of the Redis hash holding a key's buckets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DurableKey {
    pub prefix: String,
    pub key: String,
}

impl DurableKey {
    pub fn new(prefix: &str, key: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            key: key.to_string(),
        }
    }

    /// Format: "{prefix}:{key}", or just the key when the prefix is empty.
    pub fn to_redis_key(&self) -> String {
        if self.prefix.is_empty() {
            self.key.clone()
        } else {
            format!("{}:{}", self.prefix, self.key)
        }
    }
}

/// The durable counter tier.
///
/// The connection manager is shared and cloned per call; this type never
/// owns the Redis server state beyond the keys it writes.
#[derive(Clone)]
pub struct DurableCounter {
    conn: ConnectionManager,
    key_prefix: String,
    ttl: Duration,
}

impl std::fmt::Debug for DurableCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableCounter")
            .field("key_prefix", &self.key_prefix)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl DurableCounter {
    pub fn new(conn: ConnectionManager, config: &DurableConfig) -> Self {
        Self {
            conn,
            key_prefix: config.key_prefix.clone(),
            ttl: config.ttl(),
        }
    }

    /// Open a managed connection to the configured Redis server.
    pub async fn connect(config: &DurableConfig) -> Result<Self, StorageError> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = client.get_connection_manager().await?;
        debug!(key_prefix = %config.key_prefix, "Connected durable counter to Redis");
        Ok(Self::new(conn, config))
    }

    fn redis_key(&self, key: &str) -> String {
        DurableKey::new(&self.key_prefix, key).to_redis_key()
    }
}

#[async_trait]
impl CounterStore for DurableCounter {
    async fn inc(&self, key: &str, bucket: i64) -> Result<(), StorageError> {
        let redis_key = self.redis_key(key);
        let mut conn = self.conn.clone();

        // Not atomic with the increment: concurrent first writers may both
        // set the expiry, or neither sees the key missing. Either way the
        // key ends up with one.
        let existed: bool = conn.exists(&redis_key).await?;
        let count: i64 = conn.hincr(&redis_key, bucket, 1).await?;

        if !existed {
            let _: () = conn.expire(&redis_key, self.ttl.as_secs() as i64).await?;
            trace!(
                key = %redis_key,
                ttl_secs = self.ttl.as_secs(),
                "Set expiry on new durable key"
            );
        }

        trace!(key = %redis_key, bucket, count, "Incremented durable counter");
        Ok(())
    }

    async fn count(&self, key: &str, bucket: i64) -> Result<Option<u64>, StorageError> {
        let redis_key = self.redis_key(key);
        let mut conn = self.conn.clone();

        let value: Option<String> = conn.hget(&redis_key, bucket).await?;
        value
            .map(|value| parse_counter(&bucket.to_string(), &value))
            .transpose()
    }

    async fn count_all(&self, key: &str) -> Result<Option<u64>, StorageError> {
        let redis_key = self.redis_key(key);
        let mut conn = self.conn.clone();

        let fields: HashMap<String, String> = conn.hgetall(&redis_key).await?;
        sum_counters(&fields)
    }
}

/// Parse a stored counter value.
pub(crate) fn parse_counter(field: &str, value: &str) -> Result<u64, StorageError> {
    value.parse().map_err(|_| StorageError::InvalidCounter {
        field: field.to_string(),
        value: value.to_string(),
    })
}

/// Sum every field of a key's hash; `None` when the hash is empty or missing.
pub(crate) fn sum_counters(fields: &HashMap<String, String>) -> Result<Option<u64>, StorageError> {
    if fields.is_empty() {
        return Ok(None);
    }

    fields
        .iter()
        .try_fold(0u64, |total, (field, value)| {
            parse_counter(field, value).map(|count| total.saturating_add(count))
        })
        .map(Some)
}
