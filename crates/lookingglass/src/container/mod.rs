//! Container runtime management module.
//!
//! Provides an async interface to run and remove desktop containers via the
//! Docker or Podman CLI. The runtime is auto-detected or can be configured
//! explicitly.

mod container;
mod desktop;
mod error;

pub use container::{ContainerConfig, PortMapping, VolumeMount, validate_container_name};
use container::validate_label_key;
pub use desktop::{DesktopOrchestrator, DesktopSettings, RootMount, SESSION_LABEL};
pub use error::{ContainerError, ContainerResult};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::process::Command;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    #[default]
    Docker,
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }

    /// Whether this runtime requires SELinux volume labels (:Z suffix).
    pub fn needs_selinux_labels(&self) -> bool {
        match self {
            RuntimeType::Docker => false,
            RuntimeType::Podman => true,
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeType::Docker => write!(f, "docker"),
            RuntimeType::Podman => write!(f, "podman"),
        }
    }
}

/// Container runtime abstraction for testability.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Run a detached container and return its ID.
    async fn run_container(&self, config: &ContainerConfig) -> ContainerResult<String>;

    /// Forcibly remove a container. Removing an absent container succeeds.
    async fn remove_container(&self, name: &str) -> ContainerResult<()>;

    /// Names of all containers (running or not) whose name starts with
    /// `prefix` and which carry the label key `label`.
    async fn list_container_names(&self, prefix: &str, label: &str)
    -> ContainerResult<Vec<String>>;
}

/// Container runtime client shelling out to the docker/podman CLI.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    runtime_type: RuntimeType,
    binary: String,
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn run_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        self.run_container(config).await
    }

    async fn remove_container(&self, name: &str) -> ContainerResult<()> {
        self.remove_container(name).await
    }

    async fn list_container_names(
        &self,
        prefix: &str,
        label: &str,
    ) -> ContainerResult<Vec<String>> {
        self.list_container_names(prefix, label).await
    }
}

impl ContainerRuntime {
    /// Create a container runtime by probing `PATH`, preferring Docker.
    pub fn detect() -> Self {
        if Self::is_binary_available("docker") {
            Self::with_type(RuntimeType::Docker)
        } else if Self::is_binary_available("podman") {
            Self::with_type(RuntimeType::Podman)
        } else {
            // Fall back to docker, will fail at runtime
            Self::with_type(RuntimeType::Docker)
        }
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    /// Create a container runtime with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
        }
    }

    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Build the argument vector for `run`.
    pub fn run_args(&self, config: &ContainerConfig) -> Vec<String> {
        let mut args: Vec<String> = vec!["run".to_string(), "-d".to_string()];

        if config.auto_remove {
            args.push("--rm".to_string());
        }
        if config.privileged {
            args.push("--privileged".to_string());
        }

        args.push("--name".to_string());
        args.push(config.name.clone());

        for (key, value) in &config.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        for port in &config.ports {
            args.push("-p".to_string());
            args.push(port.to_arg());
        }

        for volume in &config.volumes {
            let mut options: Vec<&str> = Vec::new();
            if let Some(ref propagation) = volume.propagation {
                options.push(propagation);
            }
            if self.runtime_type.needs_selinux_labels() {
                options.push("Z");
            }
            args.push("-v".to_string());
            if options.is_empty() {
                args.push(format!("{}:{}", volume.host_path, volume.container_path));
            } else {
                args.push(format!(
                    "{}:{}:{}",
                    volume.host_path,
                    volume.container_path,
                    options.join(",")
                ));
            }
        }

        match config.rootfs {
            Some(ref rootfs) => {
                args.push("--rootfs".to_string());
                args.push(rootfs.clone());
            }
            None => args.push(config.image.clone()),
        }

        args.extend(config.command.iter().cloned());
        args
    }

    /// Run a new detached container.
    ///
    /// The configuration is validated before anything is executed.
    pub async fn run_container(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;

        let args = self.run_args(config);
        let stdout = self.exec("run", &args[..]).await?;

        Ok(stdout.trim().to_string())
    }

    /// Forcibly remove a container (`rm -f`). Missing containers are not an error.
    pub async fn remove_container(&self, name: &str) -> ContainerResult<()> {
        validate_container_name(name)?;

        match self.exec("rm", &["rm", "-f", name]).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Arguments for listing containers by name prefix and label key.
    pub fn list_args(&self, prefix: &str, label: &str) -> Vec<String> {
        vec![
            "ps".to_string(),
            "-a".to_string(),
            "--filter".to_string(),
            format!("name={}", prefix),
            "--filter".to_string(),
            format!("label={}", label),
            "--format".to_string(),
            "{{.Names}}".to_string(),
        ]
    }

    /// List container names with the given prefix that carry `label`.
    pub async fn list_container_names(
        &self,
        prefix: &str,
        label: &str,
    ) -> ContainerResult<Vec<String>> {
        validate_label_key(label)?;
        let args = self.list_args(prefix, label);
        let stdout = self.exec("ps", &args[..]).await?;

        // The runtime's name filter is a substring match.
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|name| name.starts_with(prefix))
            .map(str::to_string)
            .collect())
    }

    async fn exec<S: AsRef<std::ffi::OsStr>>(
        &self,
        command: &str,
        args: &[S],
    ) -> ContainerResult<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: command.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::CommandFailed {
                command: command.to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}
