//! Error types for the embeddings system.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for embedding operations.
pub type Result<T> = std::result::Result<T, EmbeddingError>;

/// Errors that can occur in the embeddings system.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    /// Provider not configured (missing API key, empty model name).
    #[error("embedding provider not configured: {0}")]
    ProviderNotConfigured(String),

    /// Provider unreachable or refused our credentials.
    #[error("embedding provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Provider rejected the request.
    #[error("API request failed: {0}")]
    ApiRequest(String),

    /// Provider failed with a 5xx status.
    #[error("provider error {status}: {message}")]
    Server { status: u16, message: String },

    /// Invalid response from provider.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Dimension mismatch.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Adapter settings are unusable.
    #[error("invalid embedding configuration: {0}")]
    InvalidConfiguration(String),

    /// No request capacity became available in time.
    #[error("timed out after {0:?} waiting for provider capacity")]
    Timeout(Duration),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl EmbeddingError {
    /// Whether the adapter may retry immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Server { status, .. } if *status >= 500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_server_errors_are_transient() {
        let server = EmbeddingError::Server {
            status: 503,
            message: "busy".to_string(),
        };
        assert!(server.is_transient());
        assert!(!EmbeddingError::RateLimited { retry_after_secs: 1 }.is_transient());
        assert!(!EmbeddingError::ProviderUnavailable("down".to_string()).is_transient());
    }
}
