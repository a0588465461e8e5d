//! Overlay filesystem error types.

use std::path::PathBuf;

use thiserror::Error;

pub type OverlayResult<T> = Result<T, OverlayError>;

#[derive(Debug, Error)]
pub enum OverlayError {
    /// Creating one of the upper/work/merged directories failed.
    #[error("failed to create overlay directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The shared read-only base layer does not exist.
    #[error("overlay base {0} does not exist")]
    BaseMissing(PathBuf),

    /// A path cannot be expressed in overlay mount options.
    #[error("invalid overlay path: {0}")]
    InvalidPath(String),

    #[error("mount of {target} failed: {message}")]
    Mount { target: PathBuf, message: String },

    #[error("unmount of {target} failed: {message}")]
    Unmount { target: PathBuf, message: String },

    #[error("failed to remove overlay storage {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
