//! Connection parameters and engine tuning
//!
//! Tuning can be overridden per project with a `.devsync.toml` in the local
//! root. Every key is optional.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::eyre::WrapErr as _;

/// How the remote session authenticates. Exactly one mode per run.
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    /// Public key authentication with strict host key checking
    Key {
        private_key: PathBuf,
        known_hosts: PathBuf,
    },
    /// Password authentication
    Password(String),
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key {
                private_key,
                known_hosts,
            } => f
                .debug_struct("Key")
                .field("private_key", private_key)
                .field("known_hosts", known_hosts)
                .finish(),
            Self::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

/// Where and as whom to connect. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub auth: Auth,
}

impl ConnectionConfig {
    pub const DEFAULT_PORT: u16 = 22;

    /// `user@host` destination string
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Timing and concurrency knobs of the sync engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTuning {
    /// Quiet period after the last event before a pass fires
    pub debounce: Duration,
    /// Upper bound on how long pending events may wait for a pass
    pub max_delay: Duration,
    /// Pending path count above which a pass fires immediately
    pub overflow_threshold: usize,
    /// Upload workers per pass
    pub workers: usize,
    /// Capacity of the per-pass job queue
    pub queue_capacity: usize,
    /// Capacity of the watcher -> collector event channel
    pub event_capacity: usize,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
            overflow_threshold: 1000,
            workers: 50,
            queue_capacity: 100,
            event_capacity: 10_000,
        }
    }
}

/// Project configuration file name
pub const CONFIG_FILE: &str = ".devsync.toml";

/// Contents of `.devsync.toml`
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
    pub debounce_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub overflow_threshold: Option<usize>,
    pub workers: Option<usize>,
    pub queue_capacity: Option<usize>,
    /// Gitignore-style patterns excluded from scanning, watching and syncing
    pub ignore: Vec<String>,
}

impl ProjectConfig {
    /// Load config from the project root.
    ///
    /// Returns the default config if `.devsync.toml` doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(root: &Path) -> color_eyre::Result<Self> {
        let config_path = root.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&config_path)
            .wrap_err_with(|| format!("failed to read {}", config_path.display()))?;
        toml::from_str(&content)
            .wrap_err_with(|| format!("failed to parse {}", config_path.display()))
    }

    /// Apply the values present in this file on top of `tuning`
    #[must_use]
    pub fn apply(&self, mut tuning: SyncTuning) -> SyncTuning {
        if let Some(ms) = self.debounce_ms {
            tuning.debounce = Duration::from_millis(ms);
        }
        if let Some(ms) = self.max_delay_ms {
            tuning.max_delay = Duration::from_millis(ms);
        }
        if let Some(n) = self.overflow_threshold {
            tuning.overflow_threshold = n;
        }
        if let Some(n) = self.workers {
            tuning.workers = n.max(1);
        }
        if let Some(n) = self.queue_capacity {
            tuning.queue_capacity = n.max(1);
        }
        tuning
    }
}
