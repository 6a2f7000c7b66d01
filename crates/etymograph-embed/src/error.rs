//! Error types for etymograph-embed

use etymograph_core::ErrorKind;
use thiserror::Error;

/// Errors that can occur in embedding operations
#[derive(Error, Debug)]
pub enum EmbedError {
    /// Model load or inference error
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Embedding provider unavailable
    #[error("embedding provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Provider returned the wrong number of vectors or wrong dimension
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Remote endpoint authentication failed
    #[error("remote embedding authentication failed: {0}")]
    RemoteAuth(String),

    /// Remote endpoint rate limited
    #[error("remote embedding rate limited, retry after {retry_after:?} seconds")]
    RemoteRateLimit { retry_after: Option<u64> },

    /// Remote request timed out or transport failed
    #[error("remote embedding transport error: {0}")]
    RemoteTransport(String),

    /// Persistent cache failure (non-fatal: callers degrade to LRU-only)
    #[error("embedding cache error: {0}")]
    Cache(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<candle_core::Error> for EmbedError {
    fn from(err: candle_core::Error) -> Self {
        EmbedError::Embedding(err.to_string())
    }
}

impl EmbedError {
    /// Classify for containment policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EmbedError::RemoteRateLimit { .. } | EmbedError::RemoteTransport(_) => {
                ErrorKind::Transient
            }
            EmbedError::Cache(_) => ErrorKind::ResourceMissing,
            EmbedError::RemoteAuth(_)
            | EmbedError::DimensionMismatch { .. }
            | EmbedError::Embedding(_)
            | EmbedError::ProviderUnavailable(_) => ErrorKind::Fatal,
            EmbedError::Serialization(_) => ErrorKind::Invalid,
            EmbedError::Io(_) => ErrorKind::ResourceMissing,
        }
    }

    /// Whether a retry with backoff (possibly at a smaller batch) may
    /// succeed.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Result type for embedding operations
pub type Result<T> = std::result::Result<T, EmbedError>;
