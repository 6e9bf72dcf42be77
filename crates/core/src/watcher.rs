//! Local file system watcher
//!
//! Performs the initial scan of the local tree into the local
//! [`SnapshotStore`], then keeps the snapshot and the set of watched
//! directories up to date from `notify` events. Every directory gets its own
//! non-recursive registration so newly created directories can be scanned and
//! registered individually.
//!
//! Only file creations and modifications produce a [`WatchEvent`]. Removals
//! update the snapshot silently since deletions are never pushed.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::thread;

use color_eyre::Result;
use color_eyre::eyre::WrapErr as _;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::scan::{Exclusions, scan_tree};
use crate::snapshot::{FileInfo, SnapshotStore, relative_path};

/// A local file whose snapshot entry was just created or refreshed
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchEvent {
    /// Path relative to the sync root
    pub path: String,
}

type NotifyResult = notify::Result<notify::Event>;

/// Watches the local tree and maintains the local snapshot
pub struct FsWatcher {
    root: PathBuf,
    store: SnapshotStore,
    exclusions: Exclusions,
    watcher: RecommendedWatcher,
    notifications: std_mpsc::Receiver<NotifyResult>,
    watched: HashSet<PathBuf>,
}

impl FsWatcher {
    /// Create the underlying OS watcher. Nothing is registered yet.
    ///
    /// # Errors
    /// Returns an error if the platform watch mechanism cannot be initialized.
    pub fn new(root: impl Into<PathBuf>, store: SnapshotStore, exclusions: Exclusions) -> Result<Self> {
        let (tx, notifications) = std_mpsc::channel();
        let watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .wrap_err("failed to initialize file system watcher")?;

        Ok(Self {
            root: root.into(),
            store,
            exclusions,
            watcher,
            notifications,
            watched: HashSet::new(),
        })
    }

    /// Number of directories currently registered
    #[must_use]
    pub fn watched_dirs(&self) -> usize {
        self.watched.len()
    }

    /// Register every directory under the root and record every file in the
    /// local snapshot. Returns the number of files found.
    ///
    /// # Errors
    /// Returns an error if the walk fails or a directory cannot be watched.
    pub fn initial_scan(&mut self) -> Result<usize> {
        let root = self.root.clone();
        let files = self.scan_dir(&root)?;
        let count = files.len();
        info!(
            "Scanned {count} files in {} directories under {}",
            self.watched.len(),
            root.display()
        );
        Ok(count)
    }

    /// Scan a directory, registering it and its subdirectories.
    fn scan_dir(&mut self, dir: &Path) -> Result<Vec<String>> {
        let watcher = &mut self.watcher;
        let watched = &mut self.watched;
        let files = scan_tree(dir, &self.exclusions, |path| {
            if watched.contains(path) {
                return Ok(());
            }
            watcher
                .watch(path, RecursiveMode::NonRecursive)
                .wrap_err_with(|| format!("failed to watch {}", path.display()))?;
            watched.insert(path.to_path_buf());
            trace!("Watching {}", path.display());
            Ok(())
        })?;

        let paths = files.iter().map(|(path, _)| path.clone()).collect();
        self.store.extend(files);
        Ok(paths)
    }

    /// Apply one notification to the snapshot and watch set.
    ///
    /// Returns the relative paths of files that were created or changed.
    pub fn handle_event(&mut self, event: &notify::Event) -> Vec<String> {
        if !is_relevant(&event.kind) {
            return Vec::new();
        }

        let mut emitted = Vec::new();
        for path in &event.paths {
            match std::fs::symlink_metadata(path) {
                Ok(metadata) if metadata.is_dir() => {
                    if is_creation(&event.kind) && !self.watched.contains(path) {
                        self.on_new_dir(path, &mut emitted);
                    }
                }
                Ok(metadata) => {
                    if let Some(rel) = self.tracked_path(path, false) {
                        self.store.insert(rel.clone(), FileInfo::from_metadata(&metadata));
                        debug!("Updated {rel}");
                        emitted.push(rel);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => self.on_removed(path),
                Err(e) => warn!("Failed to stat {}: {e}", path.display()),
            }
        }
        emitted
    }

    fn on_new_dir(&mut self, path: &Path, emitted: &mut Vec<String>) {
        if self.tracked_path(path, true).is_none() {
            return;
        }
        debug!("New directory {}", path.display());
        match self.scan_dir(path) {
            Ok(files) => emitted.extend(files),
            Err(e) => warn!("Failed to scan new directory {}: {e:#}", path.display()),
        }
    }

    fn on_removed(&mut self, path: &Path) {
        let Some(rel) = relative_path(&self.root, path) else {
            return;
        };

        let before = self.watched.len();
        self.watched.retain(|dir| {
            if dir.starts_with(path) {
                // The OS watch usually went away with the directory already.
                let _ = self.watcher.unwatch(dir);
                false
            } else {
                true
            }
        });
        let unwatched = before - self.watched.len();
        let removed = self.store.remove_tree(&rel);
        if removed > 0 || unwatched > 0 {
            debug!("Removed {rel} ({removed} entries, {unwatched} watches)");
        }
    }

    /// Relative path of `path` if it lies under the root and is not excluded
    fn tracked_path(&self, path: &Path, is_dir: bool) -> Option<String> {
        if self.exclusions.is_excluded(path, is_dir) {
            return None;
        }
        relative_path(&self.root, path)
    }

    /// Process notifications on a dedicated thread until the OS watcher or
    /// the receiving side of `events` goes away.
    ///
    /// # Errors
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(mut self, events: mpsc::Sender<WatchEvent>) -> Result<thread::JoinHandle<()>> {
        let handle = thread::Builder::new()
            .name("devsync-watcher".into())
            .spawn(move || {
                while let Ok(res) = self.notifications.recv() {
                    let event = match res {
                        Ok(event) => event,
                        Err(e) => {
                            warn!("Watch error: {e}");
                            continue;
                        }
                    };
                    trace!("Notification {:?} {:?}", event.kind, event.paths);
                    for path in self.handle_event(&event) {
                        if events.blocking_send(WatchEvent { path }).is_err() {
                            debug!("Event consumer gone, stopping watcher");
                            return;
                        }
                    }
                }
                debug!("Watcher channel closed");
            })?;
        Ok(handle)
    }
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
    )
}

/// Events after which an existing directory at the path is new to us
fn is_creation(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Any
            | EventKind::Modify(ModifyKind::Name(
                RenameMode::To | RenameMode::Both | RenameMode::Any
            ))
    )
}
