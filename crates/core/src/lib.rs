//! devsync-core: Live one-way sync engine
//!
//! Snapshots of the local and remote trees, the watcher that keeps the local
//! one current, event coalescing, diffing, and the bounded upload pool.
//! Talking to the remote is left to a [`RemoteTransport`] implementation.

pub mod collector;
pub mod config;
pub mod diff;
pub mod scan;
pub mod scheduler;
pub mod snapshot;
pub mod syncer;
pub mod transport;
pub mod watcher;

#[cfg(test)]
mod testing;

pub use collector::{EventCollector, FireReason, Trigger, TriggerReceiver, trigger};
pub use config::{Auth, ConnectionConfig, ProjectConfig, SyncTuning};
pub use diff::{DiffEntry, DiffKind, diff};
pub use scan::{Exclusions, scan_tree};
pub use scheduler::{UploadScheduler, UploadStats};
pub use snapshot::{FileInfo, Snapshot, SnapshotStore};
pub use syncer::{PassReport, Syncer};
pub use transport::{RemoteTransport, SyncJob, SyncOutcome, sync_file};
pub use watcher::{FsWatcher, WatchEvent};
