//! Remote side of the sync: the transport abstraction and the per-file sync
//! operation built on top of it

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use color_eyre::Result;
use color_eyre::eyre::WrapErr as _;
use tracing::debug;

use crate::snapshot::{FileInfo, Snapshot};

/// Operations the engine needs from an already-connected remote.
///
/// Remote paths are absolute, slash-separated strings.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// List every regular file below `remote_base`
    async fn list(&self, remote_base: &str) -> Result<Snapshot>;

    /// Create `dir` and its missing parents. Succeeds if it already exists.
    async fn create_dir_all(&self, dir: &str) -> Result<()>;

    /// Create or truncate `remote_path` and stream `local_path` into it.
    /// Returns the number of bytes written.
    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<u64>;

    /// Set the modification time of `remote_path` (seconds since the epoch)
    async fn set_mtime(&self, remote_path: &str, mod_time: i64) -> Result<()>;

    /// Create (or replace) a symlink at `remote_path` pointing to `target`
    async fn symlink(&self, target: &str, remote_path: &str) -> Result<()>;

    /// Delete `remote_path`. Succeeds if it does not exist.
    async fn remove(&self, remote_path: &str) -> Result<()>;
}

/// One file transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncJob {
    pub local_base: PathBuf,
    /// Slash-separated path relative to both bases
    pub relative_path: String,
    pub remote_base: String,
}

impl SyncJob {
    #[must_use]
    pub fn local_path(&self) -> PathBuf {
        self.relative_path
            .split('/')
            .fold(self.local_base.clone(), |path, part| path.join(part))
    }

    #[must_use]
    pub fn remote_path(&self) -> String {
        join_remote(&self.remote_base, &self.relative_path)
    }
}

/// Join a remote base directory and a relative path
#[must_use]
pub fn join_remote(base: &str, relative: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.is_empty() && !relative.is_empty() {
        return format!("/{relative}");
    }
    format!("{base}/{relative}")
}

/// Parent directory of a remote path, if it has one
#[must_use]
pub fn remote_parent(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(i) => Some(&path[..i]),
        None => None,
    }
}

/// Remote directories known to exist during one pass.
///
/// Only a hint: directories can vanish behind our back, which is harmless
/// because [`RemoteTransport::create_dir_all`] is idempotent and a failed
/// upload is retried on the next pass.
#[derive(Debug, Default)]
pub struct DirCache {
    dirs: Mutex<HashSet<String>>,
}

impl DirCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains(&self, dir: &str) -> bool {
        self.lock().contains(dir)
    }

    /// Record `dir` and all of its ancestors as existing
    pub fn insert(&self, dir: &str) {
        let mut dirs = self.lock();
        let mut current = Some(dir);
        while let Some(dir) = current {
            if !dirs.insert(dir.to_string()) {
                break;
            }
            current = remote_parent(dir).filter(|parent| *parent != dir);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.dirs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What [`sync_file`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// File contents copied; carries the number of bytes
    Uploaded(u64),
    /// Symlink recreated remotely
    Linked,
}

/// Push one file to the remote.
///
/// Symlinks are recreated as symlinks. Regular files get their parent
/// directory created (unless `dirs` says it exists), their contents streamed,
/// and their remote mtime set to the local one so the next diff sees them as
/// equal.
///
/// # Errors
/// Returns an error if the local file cannot be read or any remote operation
/// fails.
pub async fn sync_file<T: RemoteTransport + ?Sized>(
    transport: &T,
    job: &SyncJob,
    dirs: &DirCache,
) -> Result<SyncOutcome> {
    let local_path = job.local_path();
    let remote_path = job.remote_path();

    let metadata = tokio::fs::symlink_metadata(&local_path)
        .await
        .wrap_err_with(|| format!("failed to stat {}", local_path.display()))?;

    if metadata.file_type().is_symlink() {
        let target = tokio::fs::read_link(&local_path)
            .await
            .wrap_err_with(|| format!("failed to read symlink {}", local_path.display()))?;
        let target = target.to_string_lossy();
        ensure_parent(transport, &remote_path, dirs).await?;
        transport
            .symlink(&target, &remote_path)
            .await
            .wrap_err_with(|| format!("failed to create symlink {remote_path} -> {target}"))?;
        debug!("Linked {remote_path} -> {target}");
        return Ok(SyncOutcome::Linked);
    }

    ensure_parent(transport, &remote_path, dirs).await?;

    let bytes = transport
        .upload(&local_path, &remote_path)
        .await
        .wrap_err_with(|| format!("failed to upload {}", job.relative_path))?;

    let FileInfo { mod_time, .. } = FileInfo::from_metadata(&metadata);
    transport
        .set_mtime(&remote_path, mod_time)
        .await
        .wrap_err_with(|| format!("failed to set mtime on {remote_path}"))?;

    debug!("Uploaded {} ({bytes} bytes)", job.relative_path);
    Ok(SyncOutcome::Uploaded(bytes))
}

async fn ensure_parent<T: RemoteTransport + ?Sized>(
    transport: &T,
    remote_path: &str,
    dirs: &DirCache,
) -> Result<()> {
    let Some(parent) = remote_parent(remote_path) else {
        return Ok(());
    };
    if dirs.contains(parent) {
        return Ok(());
    }
    transport
        .create_dir_all(parent)
        .await
        .wrap_err_with(|| format!("failed to create remote directory {parent}"))?;
    dirs.insert(parent);
    Ok(())
}
