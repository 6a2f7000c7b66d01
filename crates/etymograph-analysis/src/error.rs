//! Error types for etymograph-analysis

use thiserror::Error;

/// Errors that can occur in analysis operations
#[derive(Error, Debug)]
pub enum AnalysisError {
    /// Two vectors with different dimensions were compared
    #[error("vector dimension mismatch: {a} vs {b}")]
    DimensionMismatch { a: usize, b: usize },

    /// The phylo prior table could not be read
    #[error("phylo table error in {path}: {message}")]
    PhyloTable { path: String, message: String },

    /// Unknown similarity weight preset
    #[error("unknown weight preset: {0}")]
    UnknownPreset(String),

    /// Not enough data for the requested operation
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for analysis operations
pub type Result<T> = std::result::Result<T, AnalysisError>;
