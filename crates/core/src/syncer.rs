//! Top-level orchestration
//!
//! The [`Syncer`] owns both snapshot stores and wires the pieces together:
//!
//! ```text
//! notify -> FsWatcher thread -> EventCollector task -> Trigger -> pass loop
//!                                                                  |
//!                    remote listing -> diff -> UploadScheduler <---+
//! ```
//!
//! Passes run strictly one after another; a trigger that arrives during a
//! pass is picked up once it finishes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::Result;
use color_eyre::eyre::{WrapErr as _, eyre};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::collector::{EventCollector, TriggerReceiver, trigger};
use crate::config::SyncTuning;
use crate::diff::{count_kinds, diff};
use crate::scan::Exclusions;
use crate::scheduler::{UploadScheduler, UploadStats};
use crate::snapshot::SnapshotStore;
use crate::transport::{RemoteTransport, SyncJob};
use crate::watcher::FsWatcher;

/// Outcome of one sync pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub missing_remote: usize,
    pub different: usize,
    pub uploaded: usize,
    pub linked: usize,
    pub failed: usize,
    pub bytes: u64,
    /// Whether the remote listing succeeded; if not, the pass diffed against
    /// the previous remote snapshot
    pub remote_refreshed: bool,
    pub elapsed: Duration,
}

impl PassReport {
    /// Number of files the diff asked to transfer
    #[must_use]
    pub fn scheduled(&self) -> usize {
        self.missing_remote + self.different
    }
}

/// Mirrors a local directory onto a remote one
pub struct Syncer {
    local_root: PathBuf,
    remote_root: String,
    local: SnapshotStore,
    remote: SnapshotStore,
    transport: Arc<dyn RemoteTransport>,
    scheduler: UploadScheduler,
    tuning: SyncTuning,
    exclusions: Exclusions,
}

impl Syncer {
    /// Both snapshots start out empty.
    #[must_use]
    pub fn new(
        local_root: impl Into<PathBuf>,
        remote_root: impl Into<String>,
        transport: Arc<dyn RemoteTransport>,
        tuning: SyncTuning,
    ) -> Self {
        let local_root = local_root.into();
        let scheduler =
            UploadScheduler::new(Arc::clone(&transport), tuning.workers, tuning.queue_capacity);
        Self {
            exclusions: Exclusions::none(&local_root),
            local_root,
            remote_root: remote_root.into(),
            local: SnapshotStore::new(),
            remote: SnapshotStore::new(),
            transport,
            scheduler,
            tuning,
        }
    }

    /// Skip paths matching these exclusions
    #[must_use]
    pub fn with_exclusions(mut self, exclusions: Exclusions) -> Self {
        self.exclusions = exclusions;
        self
    }

    #[must_use]
    pub fn local_snapshot(&self) -> &SnapshotStore {
        &self.local
    }

    #[must_use]
    pub fn remote_snapshot(&self) -> &SnapshotStore {
        &self.remote
    }

    /// Create the watcher and scan the local tree.
    ///
    /// # Errors
    /// Returns an error if the watch mechanism cannot be initialized or the
    /// scan fails.
    pub async fn scan(&self) -> Result<FsWatcher> {
        let mut watcher = FsWatcher::new(
            self.local_root.clone(),
            self.local.clone(),
            self.exclusions.clone(),
        )?;
        let watcher = tokio::task::spawn_blocking(move || {
            watcher.initial_scan()?;
            Ok::<_, color_eyre::Report>(watcher)
        })
        .await
        .map_err(|e| eyre!("initial scan panicked: {e}"))?
        .wrap_err_with(|| format!("failed to scan {}", self.local_root.display()))?;
        Ok(watcher)
    }

    /// Watch the local tree and run a pass whenever the collector says so.
    ///
    /// Runs an initial pass once the scan has completed. `on_pass` sees every
    /// report. Returns when the watcher stops delivering events.
    ///
    /// # Errors
    /// Returns an error if watching or the initial scan fails.
    pub async fn run(&self, mut on_pass: impl FnMut(&PassReport)) -> Result<()> {
        let watcher = self.scan().await?;
        let (trigger, mut triggers) = trigger();

        let (events_tx, events_rx) = mpsc::channel(self.tuning.event_capacity);
        let _watch_thread = watcher.spawn(events_tx)?;
        let collector = EventCollector::new((&self.tuning).into(), trigger.clone());
        let collector_task = tokio::spawn(collector.run(events_rx));

        // The scan is complete, so the first pass sees the whole tree.
        trigger.fire();
        drop(trigger);

        self.pass_loop(&mut triggers, &mut on_pass).await;
        collector_task.abort();
        Ok(())
    }

    async fn pass_loop(
        &self,
        triggers: &mut TriggerReceiver,
        on_pass: &mut impl FnMut(&PassReport),
    ) {
        while triggers.wait().await {
            let report = self.sync_pass().await;
            on_pass(&report);
        }
        debug!("Trigger channel closed, pass loop stopping");
    }

    /// Run one pass: refresh the remote snapshot, diff, upload.
    ///
    /// A failed remote listing is logged and the pass goes ahead with the
    /// previous remote snapshot.
    pub async fn sync_pass(&self) -> PassReport {
        let start = Instant::now();

        let remote_refreshed = match self.transport.list(&self.remote_root).await {
            Ok(snapshot) => {
                debug!("Remote has {} files", snapshot.len());
                self.remote.replace(snapshot);
                true
            }
            Err(e) => {
                warn!("Failed to refresh remote snapshot, using previous one: {e:#}");
                false
            }
        };

        let entries = diff(&self.local, &self.remote);
        let (missing_remote, different) = count_kinds(&entries);
        let jobs: Vec<SyncJob> = entries
            .into_iter()
            .map(|e| SyncJob {
                local_base: self.local_root.clone(),
                relative_path: e.path,
                remote_base: self.remote_root.clone(),
            })
            .collect();

        let stats = if jobs.is_empty() {
            UploadStats::default()
        } else {
            info!(
                "Syncing {} files ({missing_remote} new, {different} changed)",
                jobs.len()
            );
            self.scheduler.run(jobs).await
        };

        let report = PassReport {
            missing_remote,
            different,
            uploaded: stats.uploaded,
            linked: stats.linked,
            failed: stats.failed,
            bytes: stats.bytes,
            remote_refreshed,
            elapsed: start.elapsed(),
        };
        debug!("Pass finished: {report:?}");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::FileInfo;
    use crate::testing::MemoryTransport;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, rel: &str, len: usize, mtime: i64) {
        let path = dir.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, vec![b'x'; len]).unwrap();
        filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(mtime, 0)).unwrap();
    }

    fn syncer(local: &TempDir, transport: &Arc<MemoryTransport>) -> Syncer {
        Syncer::new(local.path(), "/remote", transport.clone(), SyncTuning::default())
    }

    #[tokio::test]
    async fn test_pass_uploads_missing_file_then_converges() {
        let local = TempDir::new().unwrap();
        write(&local, "a.txt", 100, 1_700_000_000);

        let transport = Arc::new(MemoryTransport::default());
        let syncer = syncer(&local, &transport);
        let _watcher = syncer.scan().await.unwrap();

        let first = syncer.sync_pass().await;
        assert_eq!(first.missing_remote, 1);
        assert_eq!(first.uploaded, 1);
        assert_eq!(first.bytes, 100);
        assert!(first.remote_refreshed);

        let second = syncer.sync_pass().await;
        assert_eq!(second.scheduled(), 0);
        assert_eq!(
            syncer.remote_snapshot().get("a.txt"),
            Some(FileInfo::new(100, 1_700_000_000))
        );
    }

    #[tokio::test]
    async fn test_pass_uploads_file_with_different_mtime() {
        let local = TempDir::new().unwrap();
        write(&local, "b.txt", 50, 1_000);

        let transport = Arc::new(MemoryTransport::default());
        transport.dirs.lock().unwrap().insert("/remote".into());
        transport.put("/remote/b.txt", FileInfo::new(50, 2_000));

        let syncer = syncer(&local, &transport);
        let _watcher = syncer.scan().await.unwrap();

        let report = syncer.sync_pass().await;
        assert_eq!(report.different, 1);
        assert_eq!(report.missing_remote, 0);
        assert_eq!(report.uploaded, 1);
    }

    #[tokio::test]
    async fn test_listing_failure_uses_stale_snapshot() {
        let local = TempDir::new().unwrap();
        write(&local, "c.txt", 10, 5);

        let transport = Arc::new(MemoryTransport::default());
        let syncer = syncer(&local, &transport);
        let _watcher = syncer.scan().await.unwrap();

        syncer
            .remote_snapshot()
            .insert("c.txt", FileInfo::new(10, 5));
        *transport.fail_listing.lock().unwrap() = true;

        let report = syncer.sync_pass().await;
        assert!(!report.remote_refreshed);
        assert_eq!(report.scheduled(), 0);
        assert!(syncer.remote_snapshot().contains("c.txt"));
    }

    #[tokio::test]
    async fn test_failed_job_is_retried_next_pass() {
        let local = TempDir::new().unwrap();
        write(&local, "flaky.txt", 3, 9);

        let transport = Arc::new(MemoryTransport::default());
        transport.fail_upload("/remote/flaky.txt");
        let syncer = syncer(&local, &transport);
        let _watcher = syncer.scan().await.unwrap();

        let first = syncer.sync_pass().await;
        assert_eq!(first.failed, 1);

        transport.failing.lock().unwrap().clear();
        let second = syncer.sync_pass().await;
        assert_eq!(second.missing_remote, 1);
        assert_eq!(second.uploaded, 1);
    }

    #[tokio::test]
    async fn test_remote_only_files_untouched() {
        let local = TempDir::new().unwrap();
        let transport = Arc::new(MemoryTransport::default());
        transport.put("/remote/only-here.txt", FileInfo::new(1, 1));

        let syncer = syncer(&local, &transport);
        let _watcher = syncer.scan().await.unwrap();

        let report = syncer.sync_pass().await;
        assert_eq!(
            report,
            PassReport {
                remote_refreshed: true,
                elapsed: report.elapsed,
                ..PassReport::default()
            }
        );
        assert!(transport.entry("/remote/only-here.txt").is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_new_subdirectory_yields_one_trigger() {
        let local = TempDir::new().unwrap();
        let store = SnapshotStore::new();
        let mut watcher =
            FsWatcher::new(local.path(), store.clone(), Exclusions::none(local.path())).unwrap();
        watcher.initial_scan().unwrap();

        let tuning = SyncTuning {
            debounce: Duration::from_millis(200),
            ..SyncTuning::default()
        };
        let (trigger, mut triggers) = trigger();
        let (events_tx, events_rx) = mpsc::channel(tuning.event_capacity);
        let _thread = watcher.spawn(events_tx).unwrap();
        tokio::spawn(EventCollector::new((&tuning).into(), trigger).run(events_rx));

        fs::create_dir(local.path().join("sub")).unwrap();
        fs::write(local.path().join("sub/f.txt"), "payload").unwrap();

        let fired = tokio::time::timeout(Duration::from_secs(5), triggers.wait())
            .await
            .expect("no trigger after creating sub/f.txt");
        assert!(fired);

        // Well past the quiet period: nothing else may be pending.
        tokio::time::sleep(tuning.debounce * 5).await;
        assert!(!triggers.try_take());
        assert!(store.contains("sub/f.txt"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_syncs_new_subdirectory() {
        let local = TempDir::new().unwrap();
        write(&local, "seed.txt", 1, 1);

        let transport = Arc::new(MemoryTransport::default());
        let tuning = SyncTuning {
            debounce: Duration::from_millis(100),
            ..SyncTuning::default()
        };
        let syncer = Arc::new(Syncer::new(
            local.path(),
            "/remote",
            transport.clone(),
            tuning,
        ));

        let (reports_tx, mut reports) = mpsc::unbounded_channel();
        let runner = {
            let syncer = Arc::clone(&syncer);
            tokio::spawn(async move {
                syncer
                    .run(|report| {
                        let _ = reports_tx.send(*report);
                    })
                    .await
            })
        };

        // Initial pass after the scan.
        let first = tokio::time::timeout(Duration::from_secs(10), reports.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.uploaded, 1);

        fs::create_dir(local.path().join("sub")).unwrap();
        fs::write(local.path().join("sub/new.txt"), "fresh").unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        let mut pushed = 0;
        while transport.entry("/remote/sub/new.txt")
            != Some(crate::testing::Entry::File(
                syncer.local_snapshot().get("sub/new.txt").unwrap_or_default(),
            ))
        {
            let report = tokio::time::timeout_at(deadline, reports.recv())
                .await
                .expect("new file never synced")
                .unwrap();
            pushed += report.uploaded;
        }
        assert!(pushed >= 1);
        assert_eq!(syncer.local_snapshot().get("sub/new.txt").map(|f| f.size), Some(5));

        runner.abort();
    }
}
