//! Snapshot: a point-in-time view of one directory tree
//!
//! A [`Snapshot`] maps slash-separated relative paths to [`FileInfo`]. The
//! local and the remote tree each own one, wrapped in a [`SnapshotStore`] that
//! serializes every access behind a mutex.

use std::collections::HashMap;
use std::fs::Metadata;
use std::path::{Component, Path};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Size and modification time of one file.
///
/// Two versions of a file are considered identical iff both fields match.
/// Content is never hashed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileInfo {
    /// Size in bytes
    pub size: u64,
    /// Modification time, whole seconds since the UNIX epoch
    pub mod_time: i64,
}

impl FileInfo {
    #[must_use]
    pub fn new(size: u64, mod_time: i64) -> Self {
        Self { size, mod_time }
    }

    /// Build from metadata as returned by `symlink_metadata` (symlinks are
    /// described by the link itself, not its target).
    #[must_use]
    pub fn from_metadata(metadata: &Metadata) -> Self {
        let mod_time = metadata.modified().map(unix_secs).unwrap_or(0);
        Self {
            size: metadata.len(),
            mod_time,
        }
    }
}

/// Whole seconds since the UNIX epoch, negative for earlier times.
#[must_use]
pub fn unix_secs(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
        // Truncates toward zero, like the remote listing parser.
        Err(e) => -i64::try_from(e.duration().as_secs()).unwrap_or(i64::MAX),
    }
}

/// Relative, slash-separated form of `path` under `root`.
///
/// Returns `None` if `path` is not below `root` or is `root` itself.
#[must_use]
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// All files of one tree, keyed by relative path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub files: HashMap<String, FileInfo>,
}

impl Snapshot {
    /// Create an empty snapshot
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<&FileInfo> {
        self.files.get(path)
    }

    pub fn insert(&mut self, path: impl Into<String>, info: FileInfo) -> Option<FileInfo> {
        self.files.insert(path.into(), info)
    }

    /// Remove `path` and, if it names a directory, everything beneath it.
    ///
    /// Returns the number of entries removed.
    pub fn remove_tree(&mut self, path: &str) -> usize {
        let before = self.files.len();
        let prefix = format!("{path}/");
        self.files.retain(|key, _| key != path && !key.starts_with(&prefix));
        before - self.files.len()
    }

    /// Total size of all files in bytes
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.files.values().map(|f| f.size).sum()
    }

    /// Parse the output of the remote listing command.
    ///
    /// Each line is `<relative-path> <size-bytes> <mtime-seconds.fraction>`.
    /// Lines that do not split into exactly three whitespace-separated fields,
    /// or whose numbers do not parse, are skipped.
    #[must_use]
    pub fn parse_listing(output: &str) -> Self {
        let mut snapshot = Self::empty();
        for line in output.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [path, size, mtime] = fields.as_slice() else {
                continue;
            };
            let (Ok(size), Ok(mtime)) = (size.parse::<u64>(), mtime.parse::<f64>()) else {
                continue;
            };
            if !mtime.is_finite() {
                continue;
            }
            #[allow(clippy::cast_possible_truncation)]
            let mod_time = mtime.trunc() as i64;
            snapshot.insert(*path, FileInfo::new(size, mod_time));
        }
        snapshot
    }
}

impl FromIterator<(String, FileInfo)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (String, FileInfo)>>(iter: I) -> Self {
        Self {
            files: iter.into_iter().collect(),
        }
    }
}

/// Shared, mutex-guarded [`Snapshot`].
///
/// Cloning yields another handle to the same snapshot. Every method takes the
/// lock for the duration of the call only; callers must never do I/O while
/// holding a [`SnapshotGuard`].
#[derive(Debug, Clone, Default)]
pub struct SnapshotStore {
    inner: Arc<Mutex<Snapshot>>,
}

/// Exclusive access to the snapshot inside a [`SnapshotStore`]
pub type SnapshotGuard<'a> = MutexGuard<'a, Snapshot>;

impl SnapshotStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire exclusive access.
    ///
    /// A poisoned lock is recovered: every mutation is a single map operation,
    /// so the map is never left half-updated.
    pub fn lock(&self) -> SnapshotGuard<'_> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, path: impl Into<String>, info: FileInfo) {
        self.lock().insert(path, info);
    }

    /// Insert many entries under a single lock acquisition
    pub fn extend(&self, entries: impl IntoIterator<Item = (String, FileInfo)>) {
        self.lock().files.extend(entries);
    }

    pub fn remove_tree(&self, path: &str) -> usize {
        self.lock().remove_tree(path)
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<FileInfo> {
        self.lock().get(path).copied()
    }

    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.lock().files.contains_key(path)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Swap in a freshly fetched snapshot
    pub fn replace(&self, snapshot: Snapshot) {
        *self.lock() = snapshot;
    }
}
