//! Local directory transport
//!
//! Treats a directory on this machine as the remote. Remote paths are plain
//! absolute paths. Useful for testing and for syncing onto mounted volumes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use color_eyre::Result;
use color_eyre::eyre::WrapErr as _;
use devsync_core::snapshot::relative_path;
use devsync_core::{FileInfo, RemoteTransport, Snapshot};
use filetime::FileTime;
use ignore::WalkBuilder;
use tracing::trace;

/// Local transport (no SSH, operates on the local filesystem)
#[derive(Debug, Clone)]
pub struct LocalTransport {
    root: PathBuf,
}

impl LocalTransport {
    /// Create a transport whose remote tree lives under `root`.
    ///
    /// # Errors
    /// Returns an error if `root` cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .wrap_err_with(|| format!("failed to create {}", root.display()))?;
        Ok(Self { root })
    }

    /// Remote base path to pass to the engine
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Regular files under `base`, symlinks excluded, like `find -type f`
fn list_tree(base: &Path) -> Result<Snapshot> {
    let mut snapshot = Snapshot::empty();
    let walker = WalkBuilder::new(base)
        .standard_filters(false)
        .follow_links(false)
        .build();
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let Some(rel) = relative_path(base, entry.path()) else {
            continue;
        };
        let metadata = entry.metadata()?;
        snapshot.insert(rel, FileInfo::from_metadata(&metadata));
    }
    Ok(snapshot)
}

#[async_trait]
impl RemoteTransport for LocalTransport {
    async fn list(&self, remote_base: &str) -> Result<Snapshot> {
        let base = PathBuf::from(remote_base);
        tokio::task::spawn_blocking(move || {
            list_tree(&base).wrap_err_with(|| format!("failed to list {}", base.display()))
        })
        .await?
    }

    async fn create_dir_all(&self, dir: &str) -> Result<()> {
        tokio::fs::create_dir_all(dir)
            .await
            .wrap_err_with(|| format!("failed to create {dir}"))
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<u64> {
        trace!("Copying {} to {remote_path}", local_path.display());
        let mut source = tokio::fs::File::open(local_path).await?;
        // Replace rather than write through an existing symlink.
        if tokio::fs::symlink_metadata(remote_path)
            .await
            .is_ok_and(|m| m.file_type().is_symlink())
        {
            tokio::fs::remove_file(remote_path).await?;
        }
        let mut dest = tokio::fs::File::create(remote_path)
            .await
            .wrap_err_with(|| format!("failed to create {remote_path}"))?;
        let bytes = tokio::io::copy(&mut source, &mut dest).await?;
        dest.sync_all().await?;
        Ok(bytes)
    }

    async fn set_mtime(&self, remote_path: &str, mod_time: i64) -> Result<()> {
        let path = PathBuf::from(remote_path);
        tokio::task::spawn_blocking(move || {
            filetime::set_file_mtime(&path, FileTime::from_unix_time(mod_time, 0))
        })
        .await?
        .wrap_err_with(|| format!("failed to set mtime on {remote_path}"))
    }

    #[cfg(unix)]
    async fn symlink(&self, target: &str, remote_path: &str) -> Result<()> {
        if tokio::fs::symlink_metadata(remote_path).await.is_ok() {
            tokio::fs::remove_file(remote_path).await?;
        }
        tokio::fs::symlink(target, remote_path)
            .await
            .wrap_err_with(|| format!("failed to link {remote_path} -> {target}"))
    }

    #[cfg(not(unix))]
    async fn symlink(&self, _target: &str, remote_path: &str) -> Result<()> {
        color_eyre::eyre::bail!("symlinks are not supported here ({remote_path})")
    }

    async fn remove(&self, remote_path: &str) -> Result<()> {
        match tokio::fs::remove_file(remote_path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(e).wrap_err_with(|| format!("failed to remove {remote_path}"))
            }
            _ => Ok(()),
        }
    }
}
