//! Bounded-concurrency upload scheduler
//!
//! Jobs flow through a bounded MPMC queue to a fixed pool of worker tasks.
//! Closing the queue after the last job is the drain signal; a pass is done
//! when every worker has drained it.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::transport::{DirCache, RemoteTransport, SyncJob, SyncOutcome, sync_file};

/// Totals for one batch of jobs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadStats {
    /// Files whose contents were copied
    pub uploaded: usize,
    /// Symlinks recreated
    pub linked: usize,
    /// Jobs that failed; they will show up again in the next diff
    pub failed: usize,
    /// Bytes copied
    pub bytes: u64,
}

impl UploadStats {
    fn merge(&mut self, other: Self) {
        self.uploaded += other.uploaded;
        self.linked += other.linked;
        self.failed += other.failed;
        self.bytes += other.bytes;
    }
}

/// Fans jobs out across `workers` concurrent tasks
pub struct UploadScheduler {
    transport: Arc<dyn RemoteTransport>,
    workers: usize,
    queue_capacity: usize,
}

impl UploadScheduler {
    #[must_use]
    pub fn new(transport: Arc<dyn RemoteTransport>, workers: usize, queue_capacity: usize) -> Self {
        Self {
            transport,
            workers: workers.max(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Run every job and wait until all of them have finished.
    ///
    /// A failing job is logged and counted; it never stops its siblings.
    pub async fn run(&self, jobs: Vec<SyncJob>) -> UploadStats {
        if jobs.is_empty() {
            return UploadStats::default();
        }

        let worker_count = self.workers.min(jobs.len());
        let (tx, rx) = async_channel::bounded::<SyncJob>(self.queue_capacity);
        let dirs = Arc::new(DirCache::new());

        let mut pool = JoinSet::new();
        for id in 0..worker_count {
            let rx = rx.clone();
            let transport = Arc::clone(&self.transport);
            let dirs = Arc::clone(&dirs);
            pool.spawn(async move {
                let mut stats = UploadStats::default();
                while let Ok(job) = rx.recv().await {
                    match sync_file(transport.as_ref(), &job, &dirs).await {
                        Ok(SyncOutcome::Uploaded(bytes)) => {
                            stats.uploaded += 1;
                            stats.bytes += bytes;
                        }
                        Ok(SyncOutcome::Linked) => stats.linked += 1,
                        Err(e) => {
                            warn!("Failed to sync {}: {e:#}", job.relative_path);
                            stats.failed += 1;
                        }
                    }
                }
                debug!("Upload worker {id} drained");
                stats
            });
        }
        drop(rx);

        let total = jobs.len();
        let mut sent = 0;
        for job in jobs {
            if tx.send(job).await.is_err() {
                // Every worker is gone; the rest cannot run.
                break;
            }
            sent += 1;
        }
        tx.close();

        let mut stats = UploadStats::default();
        while let Some(result) = pool.join_next().await {
            match result {
                Ok(worker_stats) => stats.merge(worker_stats),
                Err(e) => error!("Upload worker panicked: {e}"),
            }
        }

        let accounted = stats.uploaded + stats.linked + stats.failed;
        if accounted < total {
            warn!("{} of {total} jobs did not complete ({sent} queued)", total - accounted);
            stats.failed += total - accounted;
        }
        stats
    }
}
