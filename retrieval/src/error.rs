//! Error types for the retrieval engine.
//!
//! Errors from the component crates are folded into one caller-facing
//! taxonomy: configuration problems, provider failures, lookups that found
//! nothing, deadlines and cancellation, and per-document batch failures.

use mnemo_embeddings::EmbeddingError;
use mnemo_knowledge::KnowledgeError;
use mnemo_utils_cache::CacheError;
use thiserror::Error;

/// Result type alias for retrieval operations.
pub type Result<T> = std::result::Result<T, RetrievalError>;

/// Errors surfaced by [`crate::MemoryEngine`].
#[derive(Error, Debug)]
pub enum RetrievalError {
    /// Bad sizes, weights, missing session or an unusable document.
    /// Never retried.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A vector does not have the deployment's dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Embedding provider unreachable, refused credentials or kept failing.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Provider asked us to slow down.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Lookup found nothing for the key.
    #[error("not found: {key}")]
    NotFound { key: String },

    /// Deadline passed or no provider capacity became available in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Some documents of a batch failed. The ones listed in `committed`
    /// are searchable.
    #[error("{} of {} documents failed to ingest", failures.len(), failures.len() + committed.len())]
    PartialBatchFailure {
        committed: Vec<String>,
        failures: Vec<IngestFailure>,
    },

    /// Vector store failure.
    #[error("storage error: {0}")]
    Storage(String),
}

/// One document that could not be ingested.
#[derive(Debug)]
pub struct IngestFailure {
    pub document_id: String,
    pub error: RetrievalError,
}

impl RetrievalError {
    /// Whether the caller may reasonably retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable(_) | Self::RateLimited { .. } | Self::Timeout(_)
        )
    }

    /// A lookup that legitimately found nothing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub(crate) fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }
}

impl From<EmbeddingError> for RetrievalError {
    fn from(err: EmbeddingError) -> Self {
        match err {
            EmbeddingError::ProviderNotConfigured(msg) | EmbeddingError::InvalidConfiguration(msg) => {
                Self::InvalidConfiguration(msg)
            }
            EmbeddingError::DimensionMismatch { expected, actual } => {
                Self::DimensionMismatch { expected, actual }
            }
            EmbeddingError::RateLimited { retry_after_secs } => Self::RateLimited { retry_after_secs },
            EmbeddingError::Timeout(waited) => {
                Self::Timeout(format!("no provider capacity within {waited:?}"))
            }
            other => Self::ProviderUnavailable(other.to_string()),
        }
    }
}

impl From<KnowledgeError> for RetrievalError {
    fn from(err: KnowledgeError) -> Self {
        match err {
            KnowledgeError::InvalidConfiguration(_) | KnowledgeError::InvalidDocument { .. } => {
                Self::InvalidConfiguration(err.to_string())
            }
            KnowledgeError::DimensionMismatch { expected, actual } => {
                Self::DimensionMismatch { expected, actual }
            }
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<CacheError> for RetrievalError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::InvalidConfiguration(msg) => Self::InvalidConfiguration(msg),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<toml::de::Error> for RetrievalError {
    fn from(err: toml::de::Error) -> Self {
        Self::InvalidConfiguration(err.to_string())
    }
}
