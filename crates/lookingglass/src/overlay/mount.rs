//! Union mount primitives.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::error::{OverlayError, OverlayResult};

/// Performs the privileged mount/unmount calls behind the overlay manager.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Mount `lower` (read-only) under `upper`/`work` at `merged`.
    async fn mount_overlay(
        &self,
        lower: &Path,
        upper: &Path,
        work: &Path,
        merged: &Path,
    ) -> OverlayResult<()>;

    /// Lazily detach the mount at `target`.
    ///
    /// Returns `Ok(false)` when nothing was mounted there.
    async fn unmount_lazy(&self, target: &Path) -> OverlayResult<bool>;
}

/// Shells out to `mount(8)` and `umount(8)`.
#[derive(Debug, Clone, Default)]
pub struct SystemMounter;

/// Render the overlay `-o` option string.
///
/// Overlay options are comma separated and lowerdir uses ':' as a stack
/// separator, so neither character may appear in a layer path.
pub fn overlay_options(lower: &Path, upper: &Path, work: &Path) -> OverlayResult<String> {
    let mut parts = Vec::with_capacity(3);
    for (key, path) in [("lowerdir", lower), ("upperdir", upper), ("workdir", work)] {
        let text = path
            .to_str()
            .ok_or_else(|| OverlayError::InvalidPath(format!("{} is not UTF-8", path.display())))?;
        if text.is_empty() || text.contains([',', ':', '\0']) {
            return Err(OverlayError::InvalidPath(format!(
                "{} cannot be used as {}",
                text, key
            )));
        }
        parts.push(format!("{}={}", key, text));
    }
    Ok(parts.join(","))
}

#[async_trait]
impl Mounter for SystemMounter {
    #[instrument(skip(self))]
    async fn mount_overlay(
        &self,
        lower: &Path,
        upper: &Path,
        work: &Path,
        merged: &Path,
    ) -> OverlayResult<()> {
        let options = overlay_options(lower, upper, work)?;
        debug!(options = %options, "mounting overlay");

        let output = Command::new("mount")
            .args(["-t", "overlay", "overlay", "-o"])
            .arg(&options)
            .arg(merged)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| OverlayError::Mount {
                target: merged.to_path_buf(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(OverlayError::Mount {
                target: merged.to_path_buf(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unmount_lazy(&self, target: &Path) -> OverlayResult<bool> {
        if !target.exists() {
            return Ok(false);
        }

        let output = Command::new("umount")
            .arg("-l")
            .arg(target)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| OverlayError::Unmount {
                target: target.to_path_buf(),
                message: e.to_string(),
            })?;

        if output.status.success() {
            return Ok(true);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("not mounted") {
            return Ok(false);
        }
        Err(OverlayError::Unmount {
            target: target.to_path_buf(),
            message: stderr,
        })
    }
}
