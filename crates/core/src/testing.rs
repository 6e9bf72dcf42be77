//! In-memory transport used by the engine's unit tests

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use color_eyre::Result;
use color_eyre::eyre::bail;

use crate::snapshot::{FileInfo, Snapshot};
use crate::transport::{RemoteTransport, remote_parent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    File(FileInfo),
    Link(String),
}

#[derive(Debug, Default)]
pub struct MemoryTransport {
    pub entries: Mutex<HashMap<String, Entry>>,
    pub dirs: Mutex<HashSet<String>>,
    /// Remote paths whose upload fails
    pub failing: Mutex<HashSet<String>>,
    pub fail_listing: Mutex<bool>,
    pub mkdir_calls: AtomicUsize,
    pub uploads: AtomicUsize,
}

impl MemoryTransport {
    pub fn fail_upload(&self, remote_path: &str) {
        self.failing.lock().unwrap().insert(remote_path.to_string());
    }

    pub fn entry(&self, remote_path: &str) -> Option<Entry> {
        self.entries.lock().unwrap().get(remote_path).cloned()
    }

    pub fn put(&self, remote_path: &str, info: FileInfo) {
        self.entries
            .lock()
            .unwrap()
            .insert(remote_path.to_string(), Entry::File(info));
    }
}

#[async_trait]
impl RemoteTransport for MemoryTransport {
    async fn list(&self, remote_base: &str) -> Result<Snapshot> {
        if *self.fail_listing.lock().unwrap() {
            bail!("connection reset");
        }
        let prefix = format!("{}/", remote_base.trim_end_matches('/'));
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(path, entry)| match entry {
                Entry::File(info) => Some((path.strip_prefix(&prefix)?.to_string(), *info)),
                Entry::Link(_) => None,
            })
            .collect())
    }

    async fn create_dir_all(&self, dir: &str) -> Result<()> {
        self.mkdir_calls.fetch_add(1, Ordering::SeqCst);
        let mut dirs = self.dirs.lock().unwrap();
        let mut current = Some(dir);
        while let Some(dir) = current {
            dirs.insert(dir.to_string());
            current = remote_parent(dir).filter(|parent| *parent != dir);
        }
        Ok(())
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<u64> {
        if self.failing.lock().unwrap().contains(remote_path) {
            bail!("permission denied");
        }
        let parent = remote_parent(remote_path).unwrap_or("/");
        if !self.dirs.lock().unwrap().contains(parent) {
            bail!("no such directory {parent}");
        }
        let size = tokio::fs::read(local_path).await?.len() as u64;
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.put(remote_path, FileInfo::new(size, 0));
        Ok(size)
    }

    async fn set_mtime(&self, remote_path: &str, mod_time: i64) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let Some(Entry::File(info)) = entries.get_mut(remote_path) else {
            bail!("no such file {remote_path}");
        };
        info.mod_time = mod_time;
        Ok(())
    }

    async fn symlink(&self, target: &str, remote_path: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(remote_path.to_string(), Entry::Link(target.to_string()));
        Ok(())
    }

    async fn remove(&self, remote_path: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(remote_path);
        Ok(())
    }
}
