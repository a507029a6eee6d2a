//! Configuration management for ARL.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{ArlError, Result};

/// Prefix for environment variable overrides, e.g. `ARL_SERVER__HTTP_ADDR`.
const ENV_PREFIX: &str = "ARL";

/// Main configuration for the ARL service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArlConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// In-process counter tier
    #[serde(default)]
    pub fast_tier: FastTierConfig,

    /// Redis-backed counter tier
    #[serde(default)]
    pub durable: DurableConfig,

    /// Orchestration between the two tiers
    #[serde(default)]
    pub service: ServiceConfig,

    /// Quota thresholds checked by the HTTP layer
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Time in-flight requests get to finish after a shutdown signal
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl ServerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_shutdown_grace() -> u64 {
    5
}

/// How the background sweep evicts stale data from the fast tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Drop every bucket of a key once any of its buckets is stale.
    #[default]
    Key,
    /// Drop only the stale buckets; a key goes away with its last bucket.
    Bucket,
}

/// Fast tier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastTierConfig {
    /// Buckets older than this are eligible for eviction
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    /// Period of the background sweep
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// Eviction granularity
    #[serde(default)]
    pub eviction: EvictionPolicy,
}

impl Default for FastTierConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention(),
            sweep_interval_ms: default_sweep_interval(),
            eviction: EvictionPolicy::default(),
        }
    }
}

impl FastTierConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

fn default_retention() -> u64 {
    60
}

fn default_sweep_interval() -> u64 {
    3000
}

/// Durable tier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurableConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Namespace prepended to every Redis key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Expiry applied to a key when it is first written
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
}

impl Default for DurableConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            ttl_secs: default_ttl(),
        }
    }
}

impl DurableConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_key_prefix() -> String {
    "arl".to_string()
}

fn default_ttl() -> u64 {
    60
}

/// Service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Upper bound for each asynchronous durable write
    #[serde(default = "default_durable_write_timeout")]
    pub durable_write_timeout_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            durable_write_timeout_ms: default_durable_write_timeout(),
        }
    }
}

impl ServiceConfig {
    pub fn durable_write_timeout(&self) -> Duration {
        Duration::from_millis(self.durable_write_timeout_ms)
    }
}

fn default_durable_write_timeout() -> u64 {
    1000
}

/// Quota thresholds. A count strictly greater than the threshold is over quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_quota")]
    pub per_second: u64,

    #[serde(default = "default_quota")]
    pub per_hour: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            per_second: default_quota(),
            per_hour: default_quota(),
        }
    }
}

fn default_quota() -> u64 {
    10
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ArlConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ArlError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from an optional file, then apply `ARL_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ArlError::Config(e.to_string()))
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.fast_tier.sweep_interval_ms == 0 {
            return Err(ArlError::Config(
                "fast_tier.sweep_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.durable.ttl_secs == 0 {
            return Err(ArlError::Config(
                "durable.ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.service.durable_write_timeout_ms == 0 {
            return Err(ArlError::Config(
                "service.durable_write_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
