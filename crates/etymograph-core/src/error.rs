//! Error types for etymograph-core

use thiserror::Error;

/// Coarse error classification shared across the workspace.
///
/// Every error in the system maps onto one of these kinds, which decide the
/// containment policy: `Invalid` is counted and skipped per record,
/// `Transient` is retried, `Fatal` and `Integrity` abort the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad data in a single record (bad IPA, bad language code, missing field)
    Invalid,
    /// A required external resource is missing (file, cache, table)
    ResourceMissing,
    /// Temporary failure that may succeed on retry
    Transient,
    /// Unrecoverable failure
    Fatal,
    /// Stored state contradicts incoming data (checksum collision)
    Integrity,
}

/// Errors that can occur in etymograph-core operations
#[derive(Error, Debug)]
pub enum CoreError {
    /// A single record could not be parsed from its source format
    #[error("record parse error at {origin}: {message}")]
    RecordParse { origin: String, message: String },

    /// A record is missing a required field or carries an unusable value
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// The source file itself is unreadable or structurally broken
    #[error("source format error in {path}: {message}")]
    SourceFormat { path: String, message: String },

    /// Unknown loader format requested
    #[error("unknown source format: {0}")]
    UnknownFormat(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Classify this error for containment policy decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::RecordParse { .. } | CoreError::InvalidRecord(_) => ErrorKind::Invalid,
            CoreError::SourceFormat { .. } | CoreError::UnknownFormat(_) => ErrorKind::Fatal,
            CoreError::Io(_) => ErrorKind::ResourceMissing,
            CoreError::Serialization(_) => ErrorKind::Invalid,
        }
    }
}

/// Result type for etymograph-core operations
pub type Result<T> = std::result::Result<T, CoreError>;
