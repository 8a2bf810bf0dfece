//! Cache error types

use redis::RedisError;

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Raised by a data source lookup and passed through untouched.
    #[error("Backend error: {0}")]
    Backend(#[from] Box<dyn std::error::Error + Send + Sync>),

    /// A collaborator produced a cache state tag outside the known set.
    #[error("Invalid cache state tag: {0}")]
    InvalidState(u8),

    #[error("Configuration error: {0}")]
    Configuration(&'static str),

    #[error("Key codec error: {0}")]
    Codec(String),
}
