//! Session lifecycle errors.

use thiserror::Error;

use crate::auth::AuthError;

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Mount or container launch failed; partial work has been rolled back.
    #[error("provisioning failed: {0}")]
    ProvisioningFailed(String),

    /// No free backend port or session id.
    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("session not found: {0}")]
    NotFound(String),

    /// Another lifecycle operation for the same owner is in flight.
    #[error("busy: {0}")]
    Busy(String),

    /// The gateway is shutting down and accepts no new sessions.
    #[error("shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<AuthError> for SessionError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials => SessionError::InvalidCredentials,
            other => SessionError::Internal(other.to_string()),
        }
    }
}
