use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A live desktop session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: String,
    pub owner: String,
    /// Name of the desktop container, used for every runtime call.
    pub container_name: String,
    /// Per-session directory holding upper/work/merged.
    pub storage_root: PathBuf,
    /// Merged overlay handed to the container as its root.
    pub merged: PathBuf,
    /// Loopback port the desktop server is published on.
    pub port: u16,
    /// Storage is destroyed at teardown when set.
    pub ephemeral: bool,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl Session {
    /// `host:port` of the backend desktop server.
    pub fn backend_authority(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    /// True when the last activity is strictly older than `timeout` at `now`.
    pub fn is_idle(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_active) > timeout
    }

    /// Time since the session was created.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.created_at)
    }
}

#[cfg(test)]
pub(crate) fn test_session(id: &str, owner: &str, port: u16) -> Session {
    let now = Utc::now();
    Session {
        id: id.to_string(),
        owner: owner.to_string(),
        container_name: format!("desktop-{}-{}", owner, id),
        storage_root: PathBuf::from(format!("/srv/overlays/{}", owner)),
        merged: PathBuf::from(format!("/srv/overlays/{}/merged", owner)),
        port,
        ephemeral: false,
        created_at: now,
        last_active: now,
    }
}
