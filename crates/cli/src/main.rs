//! devsync: Live one-way sync to a remote host
//!
//! Mirrors a local directory onto a remote one over SSH and keeps it there:
//! - File watching with event coalescing
//! - Size + mtime change detection, no remote agent needed
//! - Parallel uploads over one multiplexed SSH connection
//! - `.gitignore`-style exclusions from `.devsync.toml`

mod debug_log;
mod progress;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{Args, Parser, Subcommand, ValueEnum, builder::Styles};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr as _, bail, eyre};
use tracing::{debug, info};

use devsync_core::config::{Auth, ConnectionConfig, ProjectConfig, SyncTuning};
use devsync_core::{Exclusions, Snapshot, Syncer, scan_tree};
use devsync_transport::SshTransport;

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "devsync")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Continuously mirror a local directory to a remote host")]
#[command(long_about = r#"
devsync pushes local edits to a remote machine as you make them.

Sync is one-way: files are created and updated remotely, never deleted.
A file is re-sent when its size or modification time differs.

Examples:
  devsync watch -l ./app -r /srv/app -u dev -i 10.0.0.5     Continuous sync
  devsync sync -l ./app -r /srv/app -u dev -i 10.0.0.5      One-time sync
  devsync scan ./app                                        Scan local directory
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch and continuously sync changes
    Watch(SyncArgs),

    /// Run a single sync pass and exit
    Sync(SyncArgs),

    /// Scan local directory and print snapshot
    Scan {
        /// Directory to scan
        path: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = ScanFormat::Summary)]
        format: ScanFormat,
    },

    /// Show version and build info
    Version,
}

#[derive(Clone, Copy, ValueEnum)]
enum ScanFormat {
    Summary,
    Json,
}

#[derive(Args)]
struct SyncArgs {
    /// Local directory to sync
    #[arg(short, long)]
    local: PathBuf,

    /// Remote directory to sync into
    #[arg(short, long)]
    remote: String,

    /// Remote user
    #[arg(short, long)]
    user: String,

    /// Remote host name or IP
    #[arg(short = 'i', long, visible_alias = "ip")]
    host: String,

    /// SSH port
    #[arg(short = 'o', long, default_value_t = ConnectionConfig::DEFAULT_PORT)]
    port: u16,

    /// Authenticate with a password instead of a key (needs `sshpass`)
    #[arg(short, long)]
    password: Option<String>,

    /// Private key [default: ~/.ssh/id_rsa]
    #[arg(short, long)]
    key: Option<PathBuf>,

    /// Known hosts file [default: ~/.ssh/known_hosts]
    #[arg(long)]
    known_hosts: Option<PathBuf>,

    /// Quiet period before a sync, in milliseconds
    #[arg(long)]
    debounce: Option<u64>,

    /// Number of parallel uploads
    #[arg(long)]
    workers: Option<usize>,
}

impl SyncArgs {
    fn connection(&self) -> Result<ConnectionConfig> {
        let auth = match &self.password {
            Some(password) => Auth::Password(password.clone()),
            None => Auth::Key {
                private_key: or_ssh_default(self.key.as_deref(), "id_rsa")?,
                known_hosts: or_ssh_default(self.known_hosts.as_deref(), "known_hosts")?,
            },
        };
        Ok(ConnectionConfig {
            user: self.user.clone(),
            host: self.host.clone(),
            port: self.port,
            auth,
        })
    }

    /// Defaults, then `.devsync.toml`, then flags
    fn tuning(&self, project: &ProjectConfig) -> SyncTuning {
        let mut tuning = project.apply(SyncTuning::default());
        if let Some(ms) = self.debounce {
            tuning.debounce = Duration::from_millis(ms);
        }
        if let Some(workers) = self.workers {
            tuning.workers = workers.max(1);
        }
        tuning
    }
}

/// `path`, or `~/.ssh/<name>` if not given
fn or_ssh_default(path: Option<&Path>, name: &str) -> Result<PathBuf> {
    if let Some(path) = path {
        return Ok(path.to_path_buf());
    }
    let home = dirs::home_dir().ok_or_else(|| eyre!("cannot determine home directory"))?;
    Ok(home.join(".ssh").join(name))
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let session = debug_log::init(cli.verbose);
    progress::log_file(&session.log_path);

    match cli.command {
        Commands::Version => {
            eprintln!("devsync {}", env!("CARGO_PKG_VERSION"));
            eprintln!("Built with Rust {}", env!("CARGO_PKG_RUST_VERSION"));
        }
        Commands::Scan { path, format } => {
            scan_command(&path, format)?;
        }
        Commands::Sync(args) => {
            sync_command(&args).await?;
        }
        Commands::Watch(args) => {
            watch_command(&args).await?;
        }
    }

    drop(session.guard);
    Ok(())
}

fn load_exclusions(root: &Path) -> Result<(ProjectConfig, Exclusions)> {
    let project = ProjectConfig::load(root)?;
    let exclusions = Exclusions::new(root, &project.ignore)?;
    Ok((project, exclusions))
}

fn scan_command(path: &Path, format: ScanFormat) -> Result<()> {
    info!("Scanning {}...", path.display());

    let (_, exclusions) = load_exclusions(path)?;
    let snapshot: Snapshot = scan_tree(path, &exclusions, |_| Ok(()))?
        .into_iter()
        .collect();

    match format {
        ScanFormat::Json => {
            let json = serde_json::to_string_pretty(&snapshot)?;
            println!("{json}");
        }
        ScanFormat::Summary => {
            eprintln!("Files: {}", snapshot.len());
            eprintln!(
                "Total size: {}",
                humansize::format_size(snapshot.total_size(), humansize::BINARY)
            );

            if snapshot.len() <= 20 {
                let mut paths: Vec<_> = snapshot.files.iter().collect();
                paths.sort_by(|a, b| a.0.cmp(b.0));
                eprintln!("\nFiles:");
                for (path, info) in paths {
                    eprintln!("  {path} ({} bytes)", info.size);
                }
            }
        }
    }

    Ok(())
}

/// Validate arguments, connect, and build the syncer
async fn prepare(args: &SyncArgs) -> Result<(Syncer, Arc<SshTransport>)> {
    if !args.local.is_dir() {
        bail!("{} is not a directory", args.local.display());
    }
    let local = args
        .local
        .canonicalize()
        .wrap_err_with(|| format!("failed to resolve {}", args.local.display()))?;

    let (project, exclusions) = load_exclusions(&local)?;
    let tuning = args.tuning(&project);
    debug!("Tuning: {tuning:?}");

    let transport = Arc::new(SshTransport::connect(args.connection()?).await?);
    progress::connected(&format!(
        "{}:{}",
        transport.config().destination(),
        args.remote
    ));

    let syncer = Syncer::new(local, args.remote.clone(), transport.clone(), tuning)
        .with_exclusions(exclusions);
    Ok((syncer, transport))
}

async fn sync_command(args: &SyncArgs) -> Result<()> {
    let (syncer, transport) = prepare(args).await?;

    let _watcher = syncer.scan().await?;
    let local = syncer.local_snapshot();
    progress::scanned(local.len(), local.lock().total_size());

    let report = syncer.sync_pass().await;
    progress::pass(&report, true);
    transport.disconnect().await?;

    if report.failed > 0 {
        bail!("{} files failed to sync", report.failed);
    }
    Ok(())
}

async fn watch_command(args: &SyncArgs) -> Result<()> {
    let (syncer, transport) = prepare(args).await?;
    progress::watching(&args.local, &args.remote);

    tokio::select! {
        result = syncer.run(|report| progress::pass(report, false)) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping");
        }
    }

    transport.disconnect().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory as _;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_watch_flags() {
        let cli = parse(&[
            "devsync", "watch", "-l", "./app", "-r", "/srv/app", "-u", "dev", "-i", "10.0.0.5",
            "-o", "2222", "-k", "/keys/id", "--known-hosts", "/keys/hosts",
        ]);
        let Commands::Watch(args) = cli.command else {
            panic!("expected watch");
        };
        assert_eq!(args.port, 2222);

        let config = args.connection().unwrap();
        assert_eq!(config.destination(), "dev@10.0.0.5");
        assert!(matches!(
            config.auth,
            Auth::Key { ref private_key, ref known_hosts }
                if private_key == Path::new("/keys/id") && known_hosts == Path::new("/keys/hosts")
        ));
    }

    #[test]
    fn test_ip_alias_and_password() {
        let cli = parse(&[
            "devsync", "sync", "--local", ".", "--remote", "/r", "--user", "u", "--ip", "host",
            "--password", "secret",
        ]);
        let Commands::Sync(args) = cli.command else {
            panic!("expected sync");
        };
        assert_eq!(args.port, 22);
        assert!(matches!(args.connection().unwrap().auth, Auth::Password(ref p) if p == "secret"));
    }

    #[test]
    fn test_flags_override_project_config() {
        let cli = parse(&[
            "devsync", "watch", "-l", ".", "-r", "/r", "-u", "u", "-i", "h", "--debounce", "50",
        ]);
        let Commands::Watch(args) = cli.command else {
            panic!("expected watch");
        };
        let project = ProjectConfig {
            debounce_ms: Some(900),
            workers: Some(8),
            ..ProjectConfig::default()
        };

        let tuning = args.tuning(&project);
        assert_eq!(tuning.debounce, Duration::from_millis(50));
        assert_eq!(tuning.workers, 8);
    }

    #[test]
    fn test_project_config_feeds_exclusions() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(".devsync.toml"),
            "workers = 3\nignore = [\"node_modules/\"]\n",
        )
        .unwrap();

        let (project, exclusions) = load_exclusions(dir.path()).unwrap();
        assert_eq!(project.workers, Some(3));
        assert!(exclusions.is_excluded(&dir.path().join("node_modules"), true));
        assert!(!exclusions.is_excluded(&dir.path().join("src"), true));
    }

    #[test]
    fn test_missing_required_flag() {
        assert!(Cli::try_parse_from(["devsync", "watch", "-l", "."]).is_err());
    }
}
