//! Error types for the MPLLM pipeline

use thiserror::Error;

/// Result type alias for MPLLM operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the MPLLM pipeline
///
/// Only configuration errors ever leave a pipeline run. Completion failures
/// and branch panics are absorbed at the stage or branch that produced them.
#[derive(Debug, Error)]
pub enum Error {
    /// A completion call could not produce a response
    #[error("Completion failed: {0}")]
    Completion(String),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Task identifier outside the supported set
    #[error("Unknown task type: {0}")]
    UnknownTask(String),

    /// Task item is missing a field its profile requires
    #[error("Task '{task}' requires field '{field}'")]
    MissingField { task: String, field: String },

    /// A fan-out branch panicked before producing a result
    #[error("Branch {index} panicked: {message}")]
    BranchPanicked { index: usize, message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a completion (transport) error
    pub fn completion(msg: impl Into<String>) -> Self {
        Self::Completion(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a missing-field error
    pub fn missing_field(task: impl Into<String>, field: impl Into<String>) -> Self {
        Self::MissingField {
            task: task.into(),
            field: field.into(),
        }
    }

    /// Create an other error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether this error is a fatal configuration problem
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::UnknownTask(_) | Self::MissingField { .. }
        )
    }
}
