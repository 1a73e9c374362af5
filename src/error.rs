//! Error types for the batch-adjust library.

use thiserror::Error;

/// Main error type for the library.
#[derive(Error, Debug)]
pub enum AdjustError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid abundance value '{value}' at row {row}, column {col}")]
    InvalidValue {
        value: String,
        row: usize,
        col: usize,
    },

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Sample ID mismatch: {0}")]
    SampleMismatch(String),

    #[error("Missing column '{0}' in metadata")]
    MissingColumn(String),

    #[error("Empty data: {0}")]
    EmptyData(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Shrinkage iteration for batch '{batch}' did not converge within {maxit} iterations")]
    Convergence { batch: String, maxit: usize },

    #[error("Internal consistency error: {0}")]
    InternalConsistency(String),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, AdjustError>;
