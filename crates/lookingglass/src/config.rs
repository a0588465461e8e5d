//! Gateway configuration.
//!
//! Loaded from TOML and layered with `LOOKINGGLASS__SECTION__KEY`
//! environment variables by the binary.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::container::{DesktopSettings, RootMount, RuntimeType};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub container: ContainerRuntimeConfig,
    pub storage: StorageConfig,
    pub sessions: SessionsConfig,
    pub auth: AuthConfig,
    pub templates: TemplatesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest request body forwarded to a desktop backend.
    pub max_proxy_body_mb: usize,
    /// How long after start-up a backend connection failure is retried.
    pub backend_startup_grace_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
            max_proxy_body_mb: 32,
            backend_startup_grace_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerRuntimeConfig {
    /// Container runtime type: "docker" or "podman"
    pub runtime: RuntimeType,
    /// Custom path to the container runtime binary
    pub binary: Option<String>,
    /// Desktop image
    pub image: String,
    /// Port the desktop web server listens on inside the container
    pub internal_port: u16,
    pub privileged: bool,
    /// "volume" bind-mounts the merged root, "rootfs" boots from it
    pub root_mount: RootMount,
    pub root_mount_target: String,
    pub name_prefix: String,
}

impl Default for ContainerRuntimeConfig {
    fn default() -> Self {
        let desktop = DesktopSettings::default();
        Self {
            runtime: RuntimeType::Docker,
            binary: None,
            image: desktop.image,
            internal_port: desktop.internal_port,
            privileged: desktop.privileged,
            root_mount: desktop.root_mount,
            root_mount_target: desktop.root_mount_target,
            name_prefix: desktop.name_prefix,
        }
    }
}

impl ContainerRuntimeConfig {
    pub fn desktop_settings(&self) -> DesktopSettings {
        DesktopSettings {
            image: self.image.clone(),
            internal_port: self.internal_port,
            privileged: self.privileged,
            root_mount: self.root_mount,
            root_mount_target: self.root_mount_target.clone(),
            name_prefix: self.name_prefix.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding every per-session overlay tree
    pub root: String,
    /// Shared read-only lower layer
    pub base: String,
    /// Name prefix of ephemeral guest trees
    pub guest_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: "/srv/overlays".to_string(),
            base: "/srv/overlays/base".to_string(),
            guest_prefix: "guest-".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub idle_timeout_minutes: i64,
    pub check_interval_seconds: u64,
    /// First backend port (inclusive)
    pub port_range_start: u16,
    /// End of the backend port range (exclusive)
    pub port_range_end: u16,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_minutes: 10,
            check_interval_seconds: 60,
            port_range_start: 10000,
            port_range_end: 15000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Directory of `<username>.toml` credential files
    pub users_dir: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            users_dir: "./users".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplatesConfig {
    /// Directory with `login.html` / `session.html` overrides
    pub dir: Option<String>,
}

impl AppConfig {
    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sessions.port_range_start >= self.sessions.port_range_end {
            bail!(
                "sessions.port_range_start ({}) must be below port_range_end ({})",
                self.sessions.port_range_start,
                self.sessions.port_range_end
            );
        }
        if (self.sessions.port_range_start..self.sessions.port_range_end)
            .contains(&self.server.port)
        {
            bail!(
                "server.port {} lies inside the backend port range",
                self.server.port
            );
        }
        if self.sessions.idle_timeout_minutes <= 0 {
            bail!("sessions.idle_timeout_minutes must be positive");
        }
        if self.sessions.check_interval_seconds == 0 {
            bail!("sessions.check_interval_seconds must be positive");
        }
        if self.server.max_proxy_body_mb == 0 {
            bail!("server.max_proxy_body_mb must be positive");
        }
        if self.container.name_prefix.is_empty() {
            bail!("container.name_prefix cannot be empty");
        }
        crate::container::validate_container_name(&self.container.name_prefix)
            .context("container.name_prefix")?;
        if self.storage.guest_prefix.is_empty() {
            bail!("storage.guest_prefix cannot be empty");
        }
        if self.storage_root()? == self.storage_base()? {
            bail!("storage.base must differ from storage.root");
        }
        Ok(())
    }

    pub fn storage_root(&self) -> Result<PathBuf> {
        expand_str_path(&self.storage.root)
    }

    pub fn storage_base(&self) -> Result<PathBuf> {
        expand_str_path(&self.storage.base)
    }

    pub fn users_dir(&self) -> Result<PathBuf> {
        expand_str_path(&self.auth.users_dir)
    }

    pub fn templates_dir(&self) -> Result<Option<PathBuf>> {
        self.templates.dir.as_deref().map(expand_str_path).transpose()
    }

    pub fn max_proxy_body_bytes(&self) -> usize {
        self.server.max_proxy_body_mb.saturating_mul(1024 * 1024)
    }
}

/// Expand `~` and `$VAR` in a configured path.
pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}
