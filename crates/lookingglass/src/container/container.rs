//! Container launch configuration and input validation.

use std::collections::BTreeMap;

use super::error::{ContainerError, ContainerResult};

/// Port mapping configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    /// Host interface to bind. `None` binds every interface.
    pub host_ip: Option<String>,
    /// Port on the host.
    pub host_port: u16,
    /// Port in the container.
    pub container_port: u16,
}

impl PortMapping {
    /// Publish `container_port` on `127.0.0.1:host_port` only.
    pub fn loopback(host_port: u16, container_port: u16) -> Self {
        Self {
            host_ip: Some("127.0.0.1".to_string()),
            host_port,
            container_port,
        }
    }

    /// Render the `-p` argument.
    pub fn to_arg(&self) -> String {
        match self.host_ip {
            Some(ref ip) => format!("{}:{}:{}", ip, self.host_port, self.container_port),
            None => format!("{}:{}", self.host_port, self.container_port),
        }
    }
}

/// A bind mount from the host into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    /// Mount propagation mode (e.g. `rshared`).
    pub propagation: Option<String>,
}

/// Configuration for running a new container.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Container name (required: every orchestrator call addresses containers by name).
    pub name: String,
    /// Docker/OCI image to use. Ignored when `rootfs` is set.
    pub image: String,
    /// Exploded root filesystem to boot instead of an image (podman `--rootfs`).
    pub rootfs: Option<String>,
    /// Command to run.
    pub command: Vec<String>,
    /// Port mappings.
    pub ports: Vec<PortMapping>,
    /// Volume mounts.
    pub volumes: Vec<VolumeMount>,
    /// Labels for the container.
    pub labels: BTreeMap<String, String>,
    /// Run with `--privileged`.
    pub privileged: bool,
    /// Remove the container when it exits (`--rm`).
    pub auto_remove: bool,
}

impl ContainerConfig {
    /// Create a new container config with the given name and image.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    /// Validate all container configuration fields.
    ///
    /// This should be called before creating a container to ensure all inputs
    /// are safe and well-formed.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_container_name(&self.name)?;

        match self.rootfs {
            Some(ref rootfs) => validate_volume_path(rootfs, "rootfs")?,
            None => validate_image_name(&self.image)?,
        }

        for volume in &self.volumes {
            validate_volume_path(&volume.host_path, "host")?;
            validate_container_path(&volume.container_path)?;
        }

        for key in self.labels.keys() {
            validate_label_key(key)?;
        }

        Ok(())
    }

    pub fn port(mut self, mapping: PortMapping) -> Self {
        self.ports.push(mapping);
        self
    }

    pub fn volume(mut self, volume: VolumeMount) -> Self {
        self.volumes.push(volume);
        self
    }

    pub fn rootfs(mut self, path: impl Into<String>) -> Self {
        self.rootfs = Some(path.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    pub fn auto_remove(mut self, auto_remove: bool) -> Self {
        self.auto_remove = auto_remove;
        self
    }
}

// ============================================================================
// Input Validation Functions
// ============================================================================

/// Validate a Docker/OCI image name.
///
/// Image names follow the pattern: `[registry/][namespace/]name[:tag][@digest]`
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric()
            || c == '.'
            || c == '-'
            || c == '_'
            || c == '/'
            || c == ':'
            || c == '@'
    };

    if !image.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' contains invalid characters",
            image
        )));
    }

    if image.contains("..") {
        return Err(ContainerError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}

/// Validate a container name.
///
/// Names follow the runtime's own rule: `[a-zA-Z0-9][a-zA-Z0-9_.-]*`.
pub fn validate_container_name(name: &str) -> ContainerResult<()> {
    let Some(first) = name.chars().next() else {
        return Err(ContainerError::InvalidInput(
            "container name cannot be empty".to_string(),
        ));
    };

    if name.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container name exceeds maximum length of 128 characters".to_string(),
        ));
    }

    if !first.is_ascii_alphanumeric() {
        return Err(ContainerError::InvalidInput(
            "container name must start with an alphanumeric character".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.';
    if !name.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container name '{}' contains invalid characters",
            name
        )));
    }

    Ok(())
}

pub(crate) fn validate_label_key(key: &str) -> ContainerResult<()> {
    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_';
    if key.is_empty() || !key.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "label key '{}' is invalid",
            key
        )));
    }
    Ok(())
}

/// Validate a host-side path handed to the runtime.
fn validate_volume_path(path: &str, side: &str) -> ContainerResult<()> {
    if path.is_empty() {
        return Err(ContainerError::InvalidInput(format!(
            "{} path cannot be empty",
            side
        )));
    }

    if path.len() > 4096 {
        return Err(ContainerError::InvalidInput(format!(
            "{} path exceeds maximum length of 4096 characters",
            side
        )));
    }

    // ':' and ',' would split the -v / --mount argument.
    let dangerous_chars = [
        '\0', '$', '`', '!', '&', '|', ';', '<', '>', '(', ')', '{', '}', '[', ']', '*', '?', '\\',
        '"', '\'', '\n', '\r', ':', ',',
    ];
    if let Some(c) = dangerous_chars.iter().find(|c| path.contains(**c)) {
        return Err(ContainerError::InvalidInput(format!(
            "{} path contains dangerous character {:?}",
            side, c
        )));
    }

    Ok(())
}

/// Validate a container-internal path.
fn validate_container_path(path: &str) -> ContainerResult<()> {
    if !path.starts_with('/') {
        return Err(ContainerError::InvalidInput(
            "container path must be absolute (start with '/')".to_string(),
        ));
    }

    if path.contains('\0') || path.contains(':') {
        return Err(ContainerError::InvalidInput(
            "container path contains an invalid character".to_string(),
        ));
    }

    Ok(())
}
