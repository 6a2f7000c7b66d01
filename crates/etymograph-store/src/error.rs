//! Error types for etymograph-store

use etymograph_core::ErrorKind;
use thiserror::Error;

/// Errors that can occur in store operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Two payloads hash to the same checksum but differ
    #[error("checksum collision: {checksum} already stored with a different payload")]
    ChecksumCollision { checksum: String },

    /// Qdrant client error
    #[error("Qdrant error: {0}")]
    Qdrant(String),

    /// Connection error
    #[error("connection failed: {0}")]
    Connection(String),

    /// Stored row cannot be decoded
    #[error("corrupt row in {table}: {message}")]
    CorruptRow { table: String, message: String },

    /// Checkpoint not found
    #[error("no checkpoint for pipeline '{0}'")]
    CheckpointNotFound(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<qdrant_client::QdrantError> for StoreError {
    fn from(err: qdrant_client::QdrantError) -> Self {
        StoreError::Qdrant(err.to_string())
    }
}

impl StoreError {
    /// Classify for containment policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::ChecksumCollision { .. } => ErrorKind::Integrity,
            StoreError::CorruptRow { .. } | StoreError::CheckpointNotFound(_) => ErrorKind::Fatal,
            StoreError::Connection(_) | StoreError::Qdrant(_) => ErrorKind::Transient,
            StoreError::Sqlite(e) => match e {
                rusqlite::Error::SqliteFailure(code, _)
                    if matches!(
                        code.code,
                        rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                    ) =>
                {
                    ErrorKind::Transient
                }
                _ => ErrorKind::Fatal,
            },
            StoreError::Serialization(_) => ErrorKind::Invalid,
            StoreError::Io(_) => ErrorKind::ResourceMissing,
        }
    }

    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;
