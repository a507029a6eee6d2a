//! Error types for the ARL service.

use thiserror::Error;

/// Failure reaching or interpreting a counter tier.
///
/// "Not found" is not an error: reads return `Ok(None)` for it.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Network or protocol failure talking to Redis
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A stored counter field is not a non-negative integer
    #[error("Invalid counter value {value:?} in field {field}")]
    InvalidCounter { field: String, value: String },
}

/// Main error type for ARL operations.
#[derive(Error, Debug)]
pub enum ArlError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A count was requested for a segment other than second or hour
    #[error("Unknown segment: {0}")]
    UnknownSegment(String),

    /// Counter storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for ARL operations.
pub type Result<T> = std::result::Result<T, ArlError>;
