//! Authoritative table of live sessions.

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::Mutex;

use super::models::Session;

/// Live sessions keyed by id behind a single lock.
///
/// The lock is only held for the map operation itself, never across
/// provisioning or teardown.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fully provisioned session.
    ///
    /// An id that is already present is rejected and the session handed back.
    pub async fn insert(&self, session: Session) -> Result<(), Session> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&session.id) {
            return Err(session);
        }
        sessions.insert(session.id.clone(), session);
        Ok(())
    }

    /// Fetch a session and refresh its activity timestamp in one step.
    ///
    /// `last_active` never moves backwards.
    pub async fn touch(&self, id: &str) -> Option<Session> {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(id)?;
        if now > session.last_active {
            session.last_active = now;
        }
        Some(session.clone())
    }

    /// Touch the live persistent session belonging to `owner`, if any.
    pub async fn touch_owner(&self, owner: &str) -> Option<Session> {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .values_mut()
            .find(|s| s.owner == owner && !s.ephemeral)?;
        if now > session.last_active {
            session.last_active = now;
        }
        Some(session.clone())
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.lock().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.lock().await.contains_key(id)
    }

    pub async fn remove(&self, id: &str) -> Option<Session> {
        self.sessions.lock().await.remove(id)
    }

    /// Remove a session only if `predicate` holds for its current state.
    pub async fn remove_if(
        &self,
        id: &str,
        predicate: impl FnOnce(&Session) -> bool,
    ) -> Option<Session> {
        let mut sessions = self.sessions.lock().await;
        if !predicate(sessions.get(id)?) {
            return None;
        }
        sessions.remove(id)
    }

    /// Consistent copy of every live session.
    pub async fn snapshot(&self) -> Vec<Session> {
        self.sessions.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    #[cfg(test)]
    pub(crate) async fn set_last_active(&self, id: &str, at: chrono::DateTime<Utc>) {
        if let Some(session) = self.sessions.lock().await.get_mut(id) {
            session.last_active = at;
        }
    }
}
