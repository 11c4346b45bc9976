//! Mount lifecycle for the store-backed subtree.
//!
//! The server mounts at most one subtree -- `<root>/repositories` -- for
//! its whole lifetime. Mount and unmount are idempotent: mounting the
//! already-mounted subtree and unmounting when nothing is mounted are both
//! successful no-ops. Unmount flushes dirty entries first and refuses to
//! tear the mount down while any of them cannot be persisted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{info, instrument};

use crate::vfs::fs::StoreFs;

pub struct MountManager {
    inner: Mutex<Option<ActiveMount>>,
}

struct ActiveMount {
    mountpoint: PathBuf,
    fs: Arc<StoreFs>,
    /// Kernel session; dropping it detaches the mount.
    #[cfg(target_os = "linux")]
    _session: Option<fuser::BackgroundSession>,
}

impl MountManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub async fn is_mounted(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    /// Establish the FUSE mount over `mountpoint`. Mounting the subtree
    /// that is already mounted is a no-op.
    #[instrument(skip(self, fs), fields(mountpoint = %mountpoint.display()))]
    pub async fn mount(&self, mountpoint: &Path, fs: Arc<StoreFs>) -> Result<()> {
        let mut guard = self.inner.lock().await;

        if let Some(active) = guard.as_ref() {
            anyhow::ensure!(
                active.mountpoint == mountpoint,
                "already mounted at {}",
                active.mountpoint.display()
            );
            return Ok(());
        }

        tokio::fs::create_dir_all(mountpoint)
            .await
            .with_context(|| format!("failed to create mountpoint: {}", mountpoint.display()))?;

        #[cfg(target_os = "linux")]
        {
            let session = spawn_session(mountpoint, Arc::clone(&fs))?;
            *guard = Some(ActiveMount {
                mountpoint: mountpoint.to_path_buf(),
                fs,
                _session: Some(session),
            });
            info!("store mount established");
            Ok(())
        }

        #[cfg(not(target_os = "linux"))]
        {
            let _ = fs;
            anyhow::bail!("object-store mounting requires FUSE, which is Linux-only")
        }
    }

    /// Flush dirty entries and tear the mount down. Unmounting when
    /// nothing is mounted is a no-op. A failed flush keeps the mount up
    /// and surfaces the error -- dirty content is never dropped.
    #[instrument(skip(self))]
    pub async fn unmount(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;

        let Some(active) = guard.take() else {
            return Ok(());
        };

        if let Err(err) = active.fs.flush_all().await {
            *guard = Some(active);
            return Err(err).context("refusing to unmount with unflushed entries");
        }

        // Dropping the background session detaches the kernel mount.
        drop(active);
        info!("store mount released");
        Ok(())
    }

    /// Register a mount without a kernel session, for exercising the
    /// idempotence contract in tests.
    #[cfg(test)]
    async fn mount_detached(&self, mountpoint: &Path, fs: Arc<StoreFs>) {
        let mut guard = self.inner.lock().await;
        *guard = Some(ActiveMount {
            mountpoint: mountpoint.to_path_buf(),
            fs,
            #[cfg(target_os = "linux")]
            _session: None,
        });
    }
}

impl Default for MountManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
fn spawn_session(mountpoint: &Path, fs: Arc<StoreFs>) -> Result<fuser::BackgroundSession> {
    use crate::vfs::fuse::StoreFilesystem;

    let options = vec![
        fuser::MountOption::FSName("gitdock".to_string()),
        fuser::MountOption::AutoUnmount,
    ];
    let adapter = StoreFilesystem::new(fs, tokio::runtime::Handle::current());
    fuser::spawn_mount2(adapter, mountpoint, &options).context("failed to establish FUSE mount")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn test_fs() -> Arc<StoreFs> {
        Arc::new(StoreFs::new(
            Arc::new(MemoryStore::new()),
            "repositories/".to_string(),
            1024,
        ))
    }

    #[tokio::test]
    async fn unmount_when_unmounted_is_noop() {
        let manager = MountManager::new();
        manager.unmount().await.unwrap();
        manager.unmount().await.unwrap();
        assert!(!manager.is_mounted().await);
    }

    #[tokio::test]
    async fn mount_when_mounted_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = MountManager::new();
        manager.mount_detached(tmp.path(), test_fs()).await;

        // Same subtree again: success without a second session.
        manager.mount(tmp.path(), test_fs()).await.unwrap();
        assert!(manager.is_mounted().await);
    }

    #[tokio::test]
    async fn mounting_a_different_subtree_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let manager = MountManager::new();
        manager.mount_detached(tmp.path(), test_fs()).await;

        assert!(manager.mount(other.path(), test_fs()).await.is_err());
    }

    #[tokio::test]
    async fn unmount_releases_the_mount() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = MountManager::new();
        manager.mount_detached(tmp.path(), test_fs()).await;

        manager.unmount().await.unwrap();
        assert!(!manager.is_mounted().await);
    }
}
