//! User credential lookup.
//!
//! Users live in one TOML file each under the users directory:
//!
//! ```toml
//! password_hash = "$2b$12$..."
//! storage = "persistent"        # or "ephemeral"
//! overlay_dir = "/srv/alice"    # optional, persistent users only
//! ```

mod error;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};

pub use error::{AuthError, AuthResult};

const MAX_USERNAME_LEN: usize = 64;

/// What happens to a user's writable layer when their session ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Upper layer survives logout and is reused on the next login.
    #[default]
    Persistent,
    /// A fresh guest tree per login, deleted at teardown.
    Ephemeral,
}

/// An authenticated principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub username: String,
    pub storage: StorageMode,
    /// Explicit storage root overriding `<storage.root>/<username>`.
    pub overlay_dir: Option<PathBuf>,
}

impl UserProfile {
    pub fn is_ephemeral(&self) -> bool {
        self.storage == StorageMode::Ephemeral
    }
}

/// Checks a username/password pair.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn authenticate(&self, username: &str, password: &str) -> AuthResult<UserProfile>;
}

/// On-disk record for a single user.
#[derive(Debug, Clone, Deserialize)]
struct UserRecord {
    password_hash: String,
    #[serde(default)]
    storage: StorageMode,
    #[serde(default)]
    overlay_dir: Option<PathBuf>,
}

/// Validate a username before it is used to build paths or container names.
pub fn validate_username(username: &str) -> Result<(), String> {
    if username.is_empty() {
        return Err("username cannot be empty".to_string());
    }
    if username.len() > MAX_USERNAME_LEN {
        return Err(format!(
            "username too long (max {} characters)",
            MAX_USERNAME_LEN
        ));
    }
    if username.starts_with('.') {
        return Err("username cannot start with '.'".to_string());
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(format!("username contains invalid characters: {}", username));
    }
    Ok(())
}

/// Hash a password for a user file.
pub fn hash_password(password: &str, cost: u32) -> AuthResult<String> {
    bcrypt::hash(password, cost).map_err(|e| AuthError::Hash(e.to_string()))
}

/// Reads `<users_dir>/<username>.toml`.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    users_dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(users_dir: impl Into<PathBuf>) -> Self {
        Self {
            users_dir: users_dir.into(),
        }
    }

    pub fn users_dir(&self) -> &Path {
        &self.users_dir
    }

    fn user_path(&self, username: &str) -> PathBuf {
        self.users_dir.join(format!("{}.toml", username))
    }

    async fn load(&self, username: &str) -> AuthResult<UserRecord> {
        let path = self.user_path(username);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No credential file for user '{}'", username);
                return Err(AuthError::InvalidCredentials);
            }
            Err(e) => {
                return Err(AuthError::CredentialFile {
                    path,
                    message: e.to_string(),
                });
            }
        };

        let record: UserRecord =
            toml::from_str(&contents).map_err(|e| AuthError::CredentialFile {
                path: path.clone(),
                message: e.to_string(),
            })?;

        if let Some(dir) = &record.overlay_dir
            && !dir.is_absolute()
        {
            return Err(AuthError::CredentialFile {
                path,
                message: format!("overlay_dir must be absolute: {}", dir.display()),
            });
        }

        Ok(record)
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn authenticate(&self, username: &str, password: &str) -> AuthResult<UserProfile> {
        if validate_username(username).is_err() {
            return Err(AuthError::InvalidCredentials);
        }

        let record = self.load(username).await?;

        let password = password.to_string();
        let hash = record.password_hash.clone();
        let verified = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
            .await
            .map_err(|e| AuthError::Internal(e.to_string()))?
            .map_err(|e| AuthError::CredentialFile {
                path: self.user_path(username),
                message: format!("unusable password_hash: {}", e),
            })?;

        if !verified {
            return Err(AuthError::InvalidCredentials);
        }

        Ok(UserProfile {
            username: username.to_string(),
            storage: record.storage,
            overlay_dir: match record.storage {
                StorageMode::Persistent => record.overlay_dir,
                StorageMode::Ephemeral => None,
            },
        })
    }
}
