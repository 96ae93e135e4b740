//! Error types for documents, chunking and indexes.

use thiserror::Error;

/// Result type alias for knowledge operations.
pub type Result<T> = std::result::Result<T, KnowledgeError>;

/// Errors that can occur while chunking or indexing knowledge.
#[derive(Error, Debug)]
pub enum KnowledgeError {
    /// Chunk sizes, overlap or index settings are unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Document rejected at the ingestion boundary.
    #[error("invalid document {id}: {reason}")]
    InvalidDocument { id: String, reason: String },

    /// Vector does not match the index dimension.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A stored row could not be decoded.
    #[error("corrupt index row: {0}")]
    CorruptRow(String),

    /// A count or offset does not fit the storage integer type.
    #[error("{column} out of range: {value}")]
    OutOfRange { column: &'static str, value: String },

    /// Backing store failure.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
