//! State store error types

use thiserror::Error;

/// Errors that can occur while persisting bridge state
#[derive(Error, Debug)]
pub enum StateError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// State directory or file name could not be derived
    #[error("Invalid state path: {0}")]
    InvalidPath(String),
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Result type alias for state operations
pub type StateResult<T> = Result<T, StateError>;
