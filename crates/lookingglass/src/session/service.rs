//! Session lifecycle: login provisioning, teardown and idle reaping.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::allocator::{PortAllocator, generate_guest_token, generate_session_id};
use super::error::{SessionError, SessionResult};
use super::models::Session;
use super::registry::SessionRegistry;
use crate::auth::{CredentialStore, StorageMode, UserProfile};
use crate::container::DesktopOrchestrator;
use crate::overlay::{OverlayManager, SweepReport};

const MAX_ID_ATTEMPTS: usize = 8;

/// What startup reconciliation cleaned up.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub containers: usize,
    pub storage: SweepReport,
}

/// Owns the registry and drives every session through its lifecycle.
///
/// Persistent owners are serialized through a per-owner lock so one upper
/// layer is never mounted twice and a login cannot race a teardown of the
/// same tree.
pub struct SessionService {
    registry: SessionRegistry,
    credentials: Arc<dyn CredentialStore>,
    overlays: OverlayManager,
    desktops: DesktopOrchestrator,
    ports: PortAllocator,
    owner_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    shutting_down: AtomicBool,
}

impl SessionService {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        overlays: OverlayManager,
        desktops: DesktopOrchestrator,
        ports: PortAllocator,
    ) -> Self {
        Self {
            registry: SessionRegistry::new(),
            credentials,
            overlays,
            desktops,
            ports,
            owner_locks: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn overlays(&self) -> &OverlayManager {
        &self.overlays
    }

    /// Fetch a session and refresh its activity.
    pub async fn touch(&self, id: &str) -> Option<Session> {
        self.registry.touch(id).await
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.registry.get(id).await
    }

    pub async fn session_count(&self) -> usize {
        self.registry.len().await
    }

    /// Refuse new sessions from now on. Live sessions are left alone.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Authenticate and bring up a desktop session.
    ///
    /// A persistent owner with a live session gets that session back
    /// (touched) instead of a second mount of the same upper layer.
    pub async fn start_session(&self, username: &str, password: &str) -> SessionResult<Session> {
        if self.is_shutting_down() {
            return Err(SessionError::ShuttingDown);
        }
        let profile = self.credentials.authenticate(username, password).await?;

        if profile.storage == StorageMode::Ephemeral {
            return self.launch(&profile).await;
        }

        let result = self.start_persistent(&profile).await;
        self.prune_owner_lock(&profile.username);
        result
    }

    async fn start_persistent(&self, profile: &UserProfile) -> SessionResult<Session> {
        let _claim = self
            .owner_lock(&profile.username)
            .try_lock_owned()
            .map_err(|_| {
                SessionError::Busy(format!(
                    "a session for '{}' is starting or stopping",
                    profile.username
                ))
            })?;

        if let Some(existing) = self.registry.touch_owner(&profile.username).await {
            info!(
                "User '{}' already has session {}, reusing it",
                profile.username, existing.id
            );
            return Ok(existing);
        }

        self.launch(profile).await
    }

    /// Tear down a session. Returns false if it was not live.
    ///
    /// The registry entry is removed before any slow cleanup runs, so
    /// concurrent callers see the id as gone and only one teardown happens.
    pub async fn stop_session(&self, id: &str) -> bool {
        self.stop_session_if(id, |_| true).await
    }

    async fn stop_session_if(&self, id: &str, predicate: impl FnOnce(&Session) -> bool) -> bool {
        let Some(current) = self.registry.get(id).await else {
            debug!("Stop requested for unknown session {}", id);
            return false;
        };

        let stopped = {
            let _claim: Option<OwnedMutexGuard<()>> = if current.ephemeral {
                None
            } else {
                Some(self.owner_lock(&current.owner).lock_owned().await)
            };

            match self.registry.remove_if(id, predicate).await {
                Some(session) => {
                    info!("Stopping session {} for '{}'", session.id, session.owner);
                    self.teardown(&session).await;
                    true
                }
                None => false,
            }
        };

        if !current.ephemeral {
            self.prune_owner_lock(&current.owner);
        }
        stopped
    }

    /// Stop every session idle for longer than `idle_timeout` as of `now`.
    ///
    /// Returns the number of sessions stopped.
    pub async fn reap_idle_sessions_at(
        &self,
        now: DateTime<Utc>,
        idle_timeout: chrono::Duration,
    ) -> usize {
        let idle: Vec<Session> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .filter(|s| s.is_idle(now, idle_timeout))
            .collect();

        let mut stopped = 0;
        for session in idle {
            // Activity may have arrived since the snapshot.
            if self
                .stop_session_if(&session.id, |s| s.is_idle(now, idle_timeout))
                .await
            {
                info!(
                    "Reaped idle session {} for '{}' (last active {})",
                    session.id, session.owner, session.last_active
                );
                stopped += 1;
            }
        }
        stopped
    }

    pub fn start_idle_reaper(
        self: Arc<Self>,
        check_interval_seconds: u64,
        idle_timeout_minutes: i64,
    ) -> tokio::task::JoinHandle<()> {
        info!(
            "Starting idle session reaper (check every {}s, timeout {}min)",
            check_interval_seconds, idle_timeout_minutes
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(check_interval_seconds));
            let timeout = chrono::Duration::minutes(idle_timeout_minutes);

            loop {
                interval.tick().await;

                let stopped = self.reap_idle_sessions_at(Utc::now(), timeout).await;
                if stopped > 0 {
                    info!("Idle reaper stopped {} session(s)", stopped);
                }
            }
        })
    }

    /// Refuse new sessions and tear down every live one. Used on shutdown.
    pub async fn stop_all(&self) -> usize {
        self.begin_shutdown();
        let sessions = self.registry.snapshot().await;
        if sessions.is_empty() {
            return 0;
        }

        info!("Stopping {} live session(s)", sessions.len());
        let mut stopped = 0;
        for session in sessions {
            if self.stop_session(&session.id).await {
                stopped += 1;
            }
        }
        stopped
    }

    /// Remove containers and mounts left behind by a previous process.
    ///
    /// Must run before the first session is started.
    pub async fn reconcile_orphans(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        match self.desktops.remove_orphans().await {
            Ok(count) => report.containers = count,
            Err(e) => warn!("Failed to list orphaned containers: {:?}", e),
        }

        match self.overlays.sweep().await {
            Ok(sweep) => report.storage = sweep,
            Err(e) => warn!("Failed to sweep overlay storage: {}", e),
        }

        if report != ReconcileReport::default() {
            info!(
                "Reconciled orphans: {} container(s), {} mount(s), {} guest tree(s)",
                report.containers, report.storage.unmounted, report.storage.removed
            );
        }
        report
    }

    async fn launch(&self, profile: &UserProfile) -> SessionResult<Session> {
        let id = self.next_session_id().await?;
        let port = self.ports.allocate().ok_or_else(|| {
            SessionError::ResourceExhausted(format!(
                "no free backend port ({} in use)",
                self.ports.leased()
            ))
        })?;

        let ephemeral = profile.is_ephemeral();
        let storage_root = match self.storage_root_for(profile) {
            Ok(root) => root,
            Err(e) => {
                self.ports.release(port);
                return Err(e);
            }
        };
        debug!(
            "Provisioning session {} for '{}' at {} (ephemeral: {})",
            id,
            profile.username,
            storage_root.display(),
            ephemeral
        );

        let merged = match self.overlays.provision(&storage_root).await {
            Ok(merged) => merged,
            Err(e) => {
                error!("Failed to provision storage for '{}': {}", profile.username, e);
                if ephemeral {
                    self.release_storage(&storage_root, true).await;
                }
                self.ports.release(port);
                return Err(SessionError::ProvisioningFailed(e.to_string()));
            }
        };

        let container_name = self.desktops.container_name(&profile.username, &id);
        if let Err(e) = self
            .desktops
            .start(&container_name, &id, &merged, port)
            .await
        {
            error!("Failed to start container {}: {}", container_name, e);
            self.release_storage(&storage_root, ephemeral).await;
            self.ports.release(port);
            return Err(SessionError::ProvisioningFailed(e.to_string()));
        }

        let now = Utc::now();
        let session = Session {
            id,
            owner: profile.username.clone(),
            container_name,
            storage_root,
            merged,
            port,
            ephemeral,
            created_at: now,
            last_active: now,
        };

        if let Err(rejected) = self.registry.insert(session.clone()).await {
            error!("Session id {} was taken during provisioning", rejected.id);
            self.teardown(&rejected).await;
            return Err(SessionError::Internal("session id collision".to_string()));
        }

        // Shutdown may have snapshotted the registry before this insert.
        if self.is_shutting_down() {
            if let Some(session) = self.registry.remove(&session.id).await {
                warn!("Shutdown began while starting session {}, stopping it", session.id);
                self.teardown(&session).await;
            }
            return Err(SessionError::ShuttingDown);
        }

        info!(
            "Started session {} for '{}' on port {}",
            session.id, session.owner, session.port
        );
        Ok(session)
    }

    async fn teardown(&self, session: &Session) {
        if let Err(e) = self.desktops.stop(&session.container_name).await {
            warn!(
                "Failed to remove container {} for session {}, it may be orphaned: {}",
                session.container_name, session.id, e
            );
        }
        self.release_storage(&session.storage_root, session.ephemeral).await;
        self.ports.release(session.port);
        debug!("Released port {} from session {}", session.port, session.id);
    }

    async fn release_storage(&self, storage_root: &std::path::Path, destroy: bool) {
        if let Err(e) = self.overlays.teardown(storage_root, destroy).await {
            warn!(
                "Failed to clean up storage {}, it may be orphaned: {}",
                storage_root.display(),
                e
            );
        }
    }

    fn storage_root_for(&self, profile: &UserProfile) -> SessionResult<PathBuf> {
        let root = match (&profile.storage, &profile.overlay_dir) {
            (StorageMode::Ephemeral, _) => {
                return Ok(self.overlays.ephemeral_root(&generate_guest_token()));
            }
            (StorageMode::Persistent, Some(dir)) => dir.clone(),
            (StorageMode::Persistent, None) => self.overlays.persistent_root(&profile.username),
        };

        if self.overlays.is_guest_path(&root) {
            return Err(SessionError::ProvisioningFailed(format!(
                "persistent storage {} lies in the guest area",
                root.display()
            )));
        }
        Ok(root)
    }

    async fn next_session_id(&self) -> SessionResult<String> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = generate_session_id();
            if !self.registry.contains(&id).await {
                return Ok(id);
            }
            warn!("Drew live session id {}, redrawing", id);
        }
        Err(SessionError::ResourceExhausted(
            "could not draw a free session id".to_string(),
        ))
    }

    fn owner_lock(&self, owner: &str) -> Arc<AsyncMutex<()>> {
        self.owner_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(owner.to_string())
            .or_default()
            .clone()
    }

    /// Drop an owner's lock once nobody holds or waits on it.
    fn prune_owner_lock(&self, owner: &str) {
        let mut locks = self
            .owner_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(owner)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(owner);
        }
    }

    #[cfg(test)]
    fn owner_lock_count(&self) -> usize {
        self.owner_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
