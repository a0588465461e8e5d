//! Desktop container orchestration on top of the runtime CLI.

use std::path::Path;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::{ContainerConfig, ContainerResult, ContainerRuntimeApi, PortMapping, VolumeMount};

/// Label attached to every desktop container, value is the session id.
pub const SESSION_LABEL: &str = "lookingglass.session";

/// How the merged overlay root is handed to the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootMount {
    /// Bind-mount the merged root into an image container (`-v merged:target:rshared`).
    #[default]
    Volume,
    /// Boot the merged root directly as the container filesystem (`--rootfs merged`).
    Rootfs,
}

/// Settings shared by every desktop container.
#[derive(Debug, Clone)]
pub struct DesktopSettings {
    pub image: String,
    /// Port of the desktop web server inside the container.
    pub internal_port: u16,
    pub privileged: bool,
    pub root_mount: RootMount,
    /// Mount target for [`RootMount::Volume`].
    pub root_mount_target: String,
    /// Prefix of every container name this gateway creates.
    pub name_prefix: String,
}

impl Default for DesktopSettings {
    fn default() -> Self {
        Self {
            image: "ubuntu-xfce-novnc".to_string(),
            internal_port: 8080,
            privileged: true,
            root_mount: RootMount::Volume,
            root_mount_target: "/".to_string(),
            name_prefix: "desktop-".to_string(),
        }
    }
}

/// Starts and stops desktop containers bound to a merged overlay root.
#[derive(Clone)]
pub struct DesktopOrchestrator {
    runtime: Arc<dyn ContainerRuntimeApi>,
    settings: DesktopSettings,
}

impl DesktopOrchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntimeApi>, settings: DesktopSettings) -> Self {
        Self { runtime, settings }
    }

    pub fn settings(&self) -> &DesktopSettings {
        &self.settings
    }

    /// Container name for an owner's session.
    pub fn container_name(&self, owner: &str, session_id: &str) -> String {
        format!("{}{}-{}", self.settings.name_prefix, owner, session_id)
    }

    /// Build the runtime configuration for one desktop container.
    pub fn container_config(
        &self,
        name: &str,
        session_id: &str,
        merged_root: &Path,
        external_port: u16,
    ) -> ContainerConfig {
        let merged = merged_root.display().to_string();
        let config = ContainerConfig::new(name, self.settings.image.clone())
            .privileged(self.settings.privileged)
            .auto_remove(true)
            .port(PortMapping::loopback(
                external_port,
                self.settings.internal_port,
            ))
            .label(SESSION_LABEL, session_id);

        match self.settings.root_mount {
            RootMount::Volume => config.volume(VolumeMount {
                host_path: merged,
                container_path: self.settings.root_mount_target.clone(),
                propagation: Some("rshared".to_string()),
            }),
            RootMount::Rootfs => config.rootfs(merged),
        }
    }

    /// Launch a desktop container.
    ///
    /// On failure the name is force-removed so no residual container stays
    /// assigned to it.
    pub async fn start(
        &self,
        name: &str,
        session_id: &str,
        merged_root: &Path,
        external_port: u16,
    ) -> ContainerResult<String> {
        let config = self.container_config(name, session_id, merged_root, external_port);
        debug!(
            "Starting container {} on 127.0.0.1:{} -> {}",
            name, external_port, self.settings.internal_port
        );

        match self.runtime.run_container(&config).await {
            Ok(id) => {
                info!("Started container {} ({})", name, id);
                Ok(id)
            }
            Err(err) => {
                if let Err(cleanup) = self.runtime.remove_container(name).await {
                    warn!(
                        "Failed to clear residual container {} after launch failure: {:?}",
                        name, cleanup
                    );
                }
                Err(err)
            }
        }
    }

    /// Forcibly remove a desktop container. Idempotent.
    pub async fn stop(&self, name: &str) -> ContainerResult<()> {
        self.runtime.remove_container(name).await?;
        info!("Removed container {}", name);
        Ok(())
    }

    /// Remove every container carrying this gateway's name prefix and
    /// session label.
    ///
    /// Returns the number of containers removed.
    pub async fn remove_orphans(&self) -> ContainerResult<usize> {
        let names = self
            .runtime
            .list_container_names(&self.settings.name_prefix, SESSION_LABEL)
            .await?;

        let mut removed = 0;
        for name in names {
            match self.runtime.remove_container(&name).await {
                Ok(()) => {
                    warn!("Removed orphaned container {}", name);
                    removed += 1;
                }
                Err(err) => warn!("Failed to remove orphaned container {}: {:?}", name, err),
            }
        }
        Ok(removed)
    }
}
