//! Error types for the tiered cache.

use thiserror::Error;

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors that can occur in a cache tier.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Persisted tier IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// External cache service failure.
    #[error("external cache error: {0}")]
    External(String),

    /// Cache configuration is not usable.
    #[error("invalid cache configuration: {0}")]
    InvalidConfiguration(String),
}
