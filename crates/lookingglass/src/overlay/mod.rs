//! Copy-on-write storage for desktop sessions.
//!
//! Every session gets a storage root holding `upper/`, `work/` and
//! `merged/`. The merged directory is an overlay of the shared base image
//! and the session's upper layer; containers see only the merged view.
//!
//! Persistent trees live at `<root>/<username>`. Guest trees live under
//! `<root>/.guests/`, a name no valid username can take.

mod error;
mod mount;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};

pub use error::{OverlayError, OverlayResult};
pub use mount::{Mounter, SystemMounter, overlay_options};

/// Directory under the storage root holding every guest tree.
pub const GUEST_DIR: &str = ".guests";

/// Directory layout beneath a session storage root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayLayout {
    pub root: PathBuf,
    pub upper: PathBuf,
    pub work: PathBuf,
    pub merged: PathBuf,
}

impl OverlayLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            upper: root.join("upper"),
            work: root.join("work"),
            merged: root.join("merged"),
            root,
        }
    }
}

/// Result of an orphan sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub unmounted: usize,
    pub removed: usize,
}

/// Provisions and tears down per-session overlay trees.
pub struct OverlayManager {
    storage_root: PathBuf,
    base: PathBuf,
    guest_prefix: String,
    mounter: Arc<dyn Mounter>,
}

impl OverlayManager {
    pub fn new(
        storage_root: impl Into<PathBuf>,
        base: impl Into<PathBuf>,
        guest_prefix: impl Into<String>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        Self {
            storage_root: storage_root.into(),
            base: base.into(),
            guest_prefix: guest_prefix.into(),
            mounter,
        }
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Storage root for a user whose changes survive logout.
    pub fn persistent_root(&self, owner: &str) -> PathBuf {
        self.storage_root.join(owner)
    }

    /// Storage root for a throwaway guest tree.
    pub fn ephemeral_root(&self, token: &str) -> PathBuf {
        self.guest_root()
            .join(format!("{}{}", self.guest_prefix, token))
    }

    /// Parent of every guest tree. Everything below it is discarded on sweep.
    pub fn guest_root(&self) -> PathBuf {
        self.storage_root.join(GUEST_DIR)
    }

    /// Whether `path` lies in the guest area and would be swept.
    pub fn is_guest_path(&self, path: &Path) -> bool {
        path.starts_with(self.guest_root())
    }

    /// Reject roots that would layer the base image over itself.
    fn check_root(&self, root: &Path) -> OverlayResult<()> {
        if root.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(OverlayError::InvalidPath(format!(
                "storage root {} contains '..'",
                root.display()
            )));
        }
        if root.starts_with(&self.base) || self.base.starts_with(root) {
            return Err(OverlayError::InvalidPath(format!(
                "storage root {} overlaps the base image {}",
                root.display(),
                self.base.display()
            )));
        }
        Ok(())
    }

    /// Create the layer directories under `root` and mount the merged view.
    ///
    /// Existing directories are reused so a persistent user's upper layer
    /// carries over between sessions. Returns the merged path.
    pub async fn provision(&self, root: &Path) -> OverlayResult<PathBuf> {
        self.check_root(root)?;
        if !self.base.is_dir() {
            return Err(OverlayError::BaseMissing(self.base.clone()));
        }

        let layout = OverlayLayout::new(root);
        for dir in [&layout.upper, &layout.work, &layout.merged] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| OverlayError::CreateDir {
                    path: dir.clone(),
                    source,
                })?;
        }

        self.mounter
            .mount_overlay(&self.base, &layout.upper, &layout.work, &layout.merged)
            .await?;

        info!("Mounted overlay at {}", layout.merged.display());
        Ok(layout.merged)
    }

    /// Detach the merged view and, when `destroy` is set, delete the tree.
    ///
    /// Unmount failures are logged and do not abort the teardown. If the
    /// merged view could not be detached, only the upper and work layers
    /// are removed so nothing is deleted through a live mount.
    pub async fn teardown(&self, root: &Path, destroy: bool) -> OverlayResult<()> {
        self.check_root(root)?;
        let layout = OverlayLayout::new(root);

        let detached = match self.mounter.unmount_lazy(&layout.merged).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to unmount {}: {}", layout.merged.display(), e);
                false
            }
        };

        if !destroy {
            return Ok(());
        }

        if detached {
            remove_tree(&layout.root).await
        } else {
            remove_tree(&layout.upper).await?;
            remove_tree(&layout.work).await?;
            warn!(
                "Left mountpoint {} in place after failed unmount",
                layout.merged.display()
            );
            Ok(())
        }
    }

    /// Clean up storage left behind by a previous run.
    ///
    /// Every merged view under the storage root is detached. Guest trees
    /// are deleted; persistent trees are kept.
    pub async fn sweep(&self) -> OverlayResult<SweepReport> {
        let mut report = SweepReport::default();
        let guest_root = self.guest_root();

        for path in list_dirs(&self.storage_root).await? {
            if path == self.base || path == guest_root {
                continue;
            }
            if self.detach_stale(&path).await == Some(true) {
                report.unmounted += 1;
            }
        }

        for path in list_dirs(&guest_root).await? {
            let Some(detached) = self.detach_stale(&path).await else {
                continue;
            };
            if detached {
                report.unmounted += 1;
            }
            match remove_tree(&path).await {
                Ok(()) => report.removed += 1,
                Err(e) => warn!("{}", e),
            }
        }

        Ok(report)
    }

    /// Lazily unmount `<root>/merged`. `None` if the unmount failed.
    async fn detach_stale(&self, root: &Path) -> Option<bool> {
        let layout = OverlayLayout::new(root);
        match self.mounter.unmount_lazy(&layout.merged).await {
            Ok(detached) => {
                if detached {
                    debug!("Detached stale overlay at {}", layout.merged.display());
                }
                Some(detached)
            }
            Err(e) => {
                warn!("Failed to detach {}: {}", layout.merged.display(), e);
                None
            }
        }
    }
}

/// Subdirectories of `dir`; a missing `dir` has none.
async fn list_dirs(dir: &Path) -> OverlayResult<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(OverlayError::Remove {
                path: dir.to_path_buf(),
                source,
            });
        }
    };

    let mut dirs = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    Ok(dirs)
}

async fn remove_tree(path: &Path) -> OverlayResult<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(OverlayError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Tracks mounts in memory instead of touching the kernel.
    #[derive(Default)]
    struct FakeMounter {
        mounted: Mutex<HashSet<PathBuf>>,
        fail_mount: bool,
        fail_unmount: bool,
    }

    #[async_trait]
    impl Mounter for FakeMounter {
        async fn mount_overlay(
            &self,
            _lower: &Path,
            _upper: &Path,
            _work: &Path,
            merged: &Path,
        ) -> OverlayResult<()> {
            if self.fail_mount {
                return Err(OverlayError::Mount {
                    target: merged.to_path_buf(),
                    message: "permission denied".to_string(),
                });
            }
            self.mounted.lock().unwrap().insert(merged.to_path_buf());
            Ok(())
        }

        async fn unmount_lazy(&self, target: &Path) -> OverlayResult<bool> {
            if self.fail_unmount {
                return Err(OverlayError::Unmount {
                    target: target.to_path_buf(),
                    message: "device busy".to_string(),
                });
            }
            Ok(self.mounted.lock().unwrap().remove(target))
        }
    }

    fn manager(dir: &Path, mounter: Arc<FakeMounter>) -> OverlayManager {
        let base = dir.join("base");
        std::fs::create_dir_all(&base).unwrap();
        OverlayManager::new(dir, base, "guest-", mounter)
    }

    #[test]
    fn test_roots() {
        let mgr = OverlayManager::new(
            "/srv/overlays",
            "/srv/overlays/base",
            "guest-",
            Arc::new(SystemMounter),
        );
        assert_eq!(mgr.persistent_root("alice"), PathBuf::from("/srv/overlays/alice"));
        assert_eq!(
            mgr.ephemeral_root("k3x9"),
            PathBuf::from("/srv/overlays/.guests/guest-k3x9")
        );
        assert!(mgr.is_guest_path(&mgr.ephemeral_root("k3x9")));
        assert!(!mgr.is_guest_path(&mgr.persistent_root("guest-bob")));
    }

    #[tokio::test]
    async fn test_provision_refuses_roots_overlapping_base() {
        let dir = tempfile::tempdir().unwrap();
        let mounter = Arc::new(FakeMounter::default());
        let mgr = manager(dir.path(), mounter.clone());

        for root in [
            mgr.persistent_root("base"),
            mgr.base().join("nested"),
            dir.path().to_path_buf(),
            dir.path().join("alice/../base"),
        ] {
            let err = mgr.provision(&root).await.unwrap_err();
            assert!(matches!(err, OverlayError::InvalidPath(_)), "{:?}", root);
        }

        assert!(!mgr.base().join("upper").exists());
        assert!(!mgr.base().join("nested").exists());
        assert!(mounter.mounted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_provision_creates_layers() {
        let dir = tempfile::tempdir().unwrap();
        let mounter = Arc::new(FakeMounter::default());
        let mgr = manager(dir.path(), mounter.clone());

        let root = mgr.persistent_root("alice");
        let merged = mgr.provision(&root).await.unwrap();

        assert_eq!(merged, root.join("merged"));
        assert!(root.join("upper").is_dir());
        assert!(root.join("work").is_dir());
        assert!(merged.is_dir());
        assert!(mounter.mounted.lock().unwrap().contains(&merged));
    }

    #[tokio::test]
    async fn test_provision_reuses_persistent_upper() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Arc::new(FakeMounter::default()));
        let root = mgr.persistent_root("alice");

        mgr.provision(&root).await.unwrap();
        std::fs::write(root.join("upper/notes.txt"), "hello").unwrap();
        mgr.teardown(&root, false).await.unwrap();

        mgr.provision(&root).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(root.join("upper/notes.txt")).unwrap(),
            "hello"
        );
    }

    #[tokio::test]
    async fn test_provision_requires_base() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = OverlayManager::new(
            dir.path(),
            dir.path().join("missing"),
            "guest-",
            Arc::new(FakeMounter::default()),
        );
        let err = mgr.provision(&dir.path().join("alice")).await.unwrap_err();
        assert!(matches!(err, OverlayError::BaseMissing(_)));
    }

    #[tokio::test]
    async fn test_provision_surfaces_mount_error() {
        let dir = tempfile::tempdir().unwrap();
        let mounter = Arc::new(FakeMounter {
            fail_mount: true,
            ..Default::default()
        });
        let mgr = manager(dir.path(), mounter);
        let err = mgr.provision(&dir.path().join("alice")).await.unwrap_err();
        assert!(matches!(err, OverlayError::Mount { .. }));
    }

    #[tokio::test]
    async fn test_teardown_destroys_ephemeral_tree() {
        let dir = tempfile::tempdir().unwrap();
        let mounter = Arc::new(FakeMounter::default());
        let mgr = manager(dir.path(), mounter.clone());

        let root = mgr.ephemeral_root("abc");
        mgr.provision(&root).await.unwrap();
        mgr.teardown(&root, true).await.unwrap();

        assert!(!root.exists());
        assert!(mounter.mounted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_keeps_persistent_tree() {
        let dir = tempfile::tempdir().unwrap();
        let mounter = Arc::new(FakeMounter::default());
        let mgr = manager(dir.path(), mounter.clone());

        let root = mgr.persistent_root("bob");
        mgr.provision(&root).await.unwrap();
        mgr.teardown(&root, false).await.unwrap();

        assert!(root.join("upper").is_dir());
        assert!(mounter.mounted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_tolerates_unmount_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(
            dir.path(),
            Arc::new(FakeMounter {
                fail_unmount: true,
                ..Default::default()
            }),
        );

        let root = mgr.ephemeral_root("abc");
        mgr.provision(&root).await.unwrap();
        mgr.teardown(&root, true).await.unwrap();

        assert!(!root.join("upper").exists());
        assert!(!root.join("work").exists());
        assert!(root.join("merged").exists());
    }

    #[tokio::test]
    async fn test_sweep_removes_guests_and_keeps_users() {
        let dir = tempfile::tempdir().unwrap();
        let mounter = Arc::new(FakeMounter::default());
        let mgr = manager(dir.path(), mounter.clone());

        let guest = mgr.ephemeral_root("stale");
        let user = mgr.persistent_root("carol");
        mgr.provision(&guest).await.unwrap();
        mgr.provision(&user).await.unwrap();

        let report = mgr.sweep().await.unwrap();
        assert_eq!(report, SweepReport { unmounted: 2, removed: 1 });
        assert!(!guest.exists());
        assert!(user.join("upper").is_dir());
        assert!(mgr.base().is_dir());
        assert!(mounter.mounted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_keeps_user_named_like_guest() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Arc::new(FakeMounter::default()));

        let user = mgr.persistent_root("guest-bob");
        mgr.provision(&user).await.unwrap();
        std::fs::write(user.join("upper/thesis.txt"), "chapter 1").unwrap();
        mgr.teardown(&user, false).await.unwrap();

        let report = mgr.sweep().await.unwrap();
        assert_eq!(report.removed, 0);
        assert_eq!(
            std::fs::read_to_string(user.join("upper/thesis.txt")).unwrap(),
            "chapter 1"
        );
    }

    #[tokio::test]
    async fn test_sweep_missing_storage_root() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = OverlayManager::new(
            dir.path().join("nope"),
            dir.path().join("nope/base"),
            "guest-",
            Arc::new(FakeMounter::default()),
        );
        assert_eq!(mgr.sweep().await.unwrap(), SweepReport::default());
    }
}
