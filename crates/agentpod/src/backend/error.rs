//! Container backend error types.

use thiserror::Error;

/// Result type for backend operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors raised while driving a container engine CLI.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The engine command ran and reported failure.
    #[error("{binary} {command} failed: {message}")]
    CommandFailed {
        binary: String,
        command: String,
        message: String,
    },

    /// The engine binary could not be launched.
    #[error("container engine '{0}' not found in PATH")]
    EngineNotFound(String),

    /// Container was not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// The backend cannot do what was asked.
    #[error("{backend} backend does not support {what}")]
    Unsupported { backend: String, what: String },

    /// Failed to parse engine output.
    #[error("failed to parse engine output: {0}")]
    ParseError(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    /// Map a spawn failure of `binary` to a backend error.
    pub(crate) fn spawn(binary: &str, command: &str, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            ContainerError::EngineNotFound(binary.to_string())
        } else {
            ContainerError::CommandFailed {
                binary: binary.to_string(),
                command: command.to_string(),
                message: err.to_string(),
            }
        }
    }
}
