//! Error types for etymograph-pipeline
//!
//! User-visible pipeline errors always carry the pipeline name, the stage,
//! and where in the input the failure happened (batch id or cursor), so an
//! aborted run can be located without log archaeology.

use etymograph_core::ErrorKind;
use thiserror::Error;

/// Errors that can occur while running a pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Core (loader/cleaner) error
    #[error(transparent)]
    Core(#[from] etymograph_core::CoreError),

    /// Storage error
    #[error(transparent)]
    Store(#[from] etymograph_store::StoreError),

    /// Embedding error
    #[error(transparent)]
    Embed(#[from] etymograph_embed::EmbedError),

    /// A stage hit a fatal failure
    #[error("pipeline '{pipeline}' stage '{stage}' failed at batch {batch_id} (cursor {cursor}): {message}")]
    StageFailed {
        pipeline: String,
        stage: String,
        batch_id: u64,
        cursor: u64,
        message: String,
    },

    /// Per-item errors exceeded the sliding-window rate
    #[error("pipeline '{pipeline}' stage '{stage}' aborted: error rate {rate:.2} over the last {window} items")]
    ErrorRateExceeded {
        pipeline: String,
        stage: String,
        rate: f64,
        window: usize,
    },

    /// A retry budget ran out on a transient failure
    #[error("pipeline '{pipeline}' stage '{stage}' exhausted {attempts} retries: {message}")]
    RetriesExhausted {
        pipeline: String,
        stage: String,
        attempts: u32,
        message: String,
    },

    /// A worker task panicked or was torn down
    #[error("pipeline '{pipeline}' worker panicked in stage '{stage}': {message}")]
    WorkerPanic {
        pipeline: String,
        stage: String,
        message: String,
    },

    /// The run was cancelled before completion
    #[error("pipeline '{0}' cancelled")]
    Cancelled(String),
}

impl PipelineError {
    /// Classify for containment policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Core(e) => e.kind(),
            PipelineError::Store(e) => e.kind(),
            PipelineError::Embed(e) => e.kind(),
            PipelineError::RetriesExhausted { .. } => ErrorKind::Transient,
            PipelineError::StageFailed { .. }
            | PipelineError::ErrorRateExceeded { .. }
            | PipelineError::WorkerPanic { .. }
            | PipelineError::Cancelled(_) => ErrorKind::Fatal,
        }
    }

    /// Sysexits-style process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Core(e) => match e.kind() {
                ErrorKind::Invalid | ErrorKind::Fatal => 65,
                ErrorKind::ResourceMissing => 74,
                _ => 70,
            },
            PipelineError::Store(e) => match e.kind() {
                ErrorKind::Transient => 75,
                ErrorKind::ResourceMissing => 74,
                _ => 70,
            },
            PipelineError::Embed(e) => match e.kind() {
                ErrorKind::Transient => 75,
                ErrorKind::ResourceMissing => 74,
                _ => 70,
            },
            PipelineError::RetriesExhausted { .. } => 75,
            PipelineError::StageFailed { .. }
            | PipelineError::ErrorRateExceeded { .. }
            | PipelineError::WorkerPanic { .. }
            | PipelineError::Cancelled(_) => 70,
        }
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let err = PipelineError::RetriesExhausted {
            pipeline: "ingest".into(),
            stage: "writer".into(),
            attempts: 5,
            message: "db busy".into(),
        };
        assert_eq!(err.exit_code(), 75);

        let err = PipelineError::WorkerPanic {
            pipeline: "ingest".into(),
            stage: "cleaner".into(),
            message: "boom".into(),
        };
        assert_eq!(err.exit_code(), 70);
    }

    #[test]
    fn test_stage_failed_message_carries_context() {
        let err = PipelineError::StageFailed {
            pipeline: "ingest:wikt".into(),
            stage: "typed-writer".into(),
            batch_id: 17,
            cursor: 123456,
            message: "constraint violated".into(),
        };
        let text = err.to_string();
        assert!(text.contains("ingest:wikt"));
        assert!(text.contains("typed-writer"));
        assert!(text.contains("17"));
        assert!(text.contains("123456"));
    }
}
