//! Credential store errors.

use std::path::PathBuf;

use thiserror::Error;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Unknown user, wrong password or a username that cannot name a user.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// A user file exists but cannot be used.
    #[error("bad credential file {path}: {message}")]
    CredentialFile { path: PathBuf, message: String },

    #[error("password hashing failed: {0}")]
    Hash(String),

    #[error("internal error: {0}")]
    Internal(String),
}
