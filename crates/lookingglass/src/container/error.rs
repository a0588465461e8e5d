//! Container runtime error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur during container operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The runtime CLI rejected the command (image missing, port conflict, limits).
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Container was not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    /// Whether the runtime reported that the named container does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            ContainerError::ContainerNotFound(_) => true,
            ContainerError::CommandFailed { message, .. } => {
                message.to_ascii_lowercase().contains("no such container")
            }
            _ => false,
        }
    }
}
