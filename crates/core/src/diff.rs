//! One-way diff of the local snapshot against the remote one

use crate::snapshot::{FileInfo, Snapshot, SnapshotStore};

/// Why a path needs to be transferred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffKind {
    /// Present locally, absent remotely
    MissingRemote,
    /// Present on both sides with a different size or modification time
    Different,
}

/// A single path that must be pushed to the remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub kind: DiffKind,
    pub path: String,
    pub local: FileInfo,
    /// Zeroed for [`DiffKind::MissingRemote`]
    pub remote: FileInfo,
}

/// Compare two snapshot stores.
///
/// Locks `local` first, then `remote`. Every caller goes through here, so the
/// order is the same everywhere. The two stores must be distinct.
#[must_use]
pub fn diff(local: &SnapshotStore, remote: &SnapshotStore) -> Vec<DiffEntry> {
    let local = local.lock();
    let remote = remote.lock();
    diff_snapshots(&local, &remote)
}

/// Compare two snapshots.
///
/// Paths only present in `remote` are not reported: remote-only files are
/// left alone since deletions are never propagated.
#[must_use]
pub fn diff_snapshots(local: &Snapshot, remote: &Snapshot) -> Vec<DiffEntry> {
    local
        .files
        .iter()
        .filter_map(|(path, &local_info)| match remote.get(path) {
            None => Some(DiffEntry {
                kind: DiffKind::MissingRemote,
                path: path.clone(),
                local: local_info,
                remote: FileInfo::default(),
            }),
            Some(&remote_info) if remote_info != local_info => Some(DiffEntry {
                kind: DiffKind::Different,
                path: path.clone(),
                local: local_info,
                remote: remote_info,
            }),
            Some(_) => None,
        })
        .collect()
}

/// Counts of each [`DiffKind`] in a diff
#[must_use]
pub fn count_kinds(entries: &[DiffEntry]) -> (usize, usize) {
    entries.iter().fold((0, 0), |(missing, different), e| match e.kind {
        DiffKind::MissingRemote => (missing + 1, different),
        DiffKind::Different => (missing, different + 1),
    })
}
