//! SSH transport implementation using the system `ssh` command
//!
//! Uses system SSH for reliability and to leverage the user's existing SSH
//! setup. One master connection is opened in [`SshTransport::connect`]; every
//! later command is multiplexed over it through a control socket, so the
//! upload workers never pay for a handshake.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use color_eyre::Result;
use color_eyre::eyre::{WrapErr as _, bail, eyre};
use devsync_core::config::{Auth, ConnectionConfig};
use devsync_core::{RemoteTransport, Snapshot};
use tokio::io::AsyncWriteExt as _;
use tokio::process::Command;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, trace};

/// How long the master connection outlives its last client, in seconds
const CONTROL_PERSIST_SECS: u32 = 60;

/// Environment variable `sshpass -e` reads the password from
const SSHPASS_ENV: &str = "SSHPASS";

/// Concurrent sessions on the master connection. Stays below sshd's default
/// `MaxSessions` of 10, which also counts the master's own session.
pub const MAX_SESSIONS: usize = 8;

/// SSH transport for communicating with a remote host
pub struct SshTransport {
    config: ConnectionConfig,
    control_path: PathBuf,
    sessions: Semaphore,
}

impl SshTransport {
    /// Connect to the remote host and open the shared master connection.
    ///
    /// # Errors
    /// Returns an error if the host is unreachable, its key is not in the
    /// known-hosts file, or authentication fails.
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        info!("Connecting to {}:{}", config.destination(), config.port);

        if let Auth::Key { private_key, .. } = &config.auth {
            if !private_key.exists() {
                bail!("private key {} does not exist", private_key.display());
            }
        }

        let control_path =
            std::env::temp_dir().join(format!("devsync-{}-%C", std::process::id()));
        let transport = Self {
            config,
            control_path,
            sessions: Semaphore::new(MAX_SESSIONS),
        };

        let (stdout, stderr, code) = transport.execute("echo ok").await?;
        if code != 0 || stdout.trim() != "ok" {
            bail!(
                "SSH connection to {} failed: {}",
                transport.config.destination(),
                stderr.trim()
            );
        }

        info!("Connected to {}", transport.config.destination());
        Ok(transport)
    }

    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Close the master connection.
    ///
    /// # Errors
    /// Returns an error if `ssh` cannot be run.
    pub async fn disconnect(&self) -> Result<()> {
        let mut cmd = self.ssh();
        cmd.args(["-O", "exit", &self.config.destination()]);
        let output = cmd.output().await?;
        debug!(
            "Master connection closed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
        Ok(())
    }

    /// Base `ssh` invocation with connection sharing and authentication
    /// options, without destination or command.
    fn ssh(&self) -> Command {
        let mut cmd = match &self.config.auth {
            Auth::Password(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.env(SSHPASS_ENV, password).args(["-e", "ssh"]);
                cmd
            }
            Auth::Key { .. } => Command::new("ssh"),
        };
        cmd.args(self.ssh_options());
        cmd.kill_on_drop(true);
        cmd
    }

    fn ssh_options(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.config.port.to_string(),
            "-o".into(),
            "ConnectTimeout=10".into(),
            "-o".into(),
            "ControlMaster=auto".into(),
            "-o".into(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".into(),
            format!("ControlPersist={CONTROL_PERSIST_SECS}"),
            "-o".into(),
            "StrictHostKeyChecking=yes".into(),
        ];
        match &self.config.auth {
            Auth::Key {
                private_key,
                known_hosts,
            } => {
                args.extend([
                    "-o".into(),
                    "BatchMode=yes".into(),
                    "-o".into(),
                    "IdentitiesOnly=yes".into(),
                    "-i".into(),
                    private_key.display().to_string(),
                    "-o".into(),
                    format!("UserKnownHostsFile={}", known_hosts.display()),
                ]);
            }
            Auth::Password(_) => {
                args.extend([
                    "-o".into(),
                    "PreferredAuthentications=password,keyboard-interactive".into(),
                    "-o".into(),
                    "PubkeyAuthentication=no".into(),
                ]);
            }
        }
        args
    }

    /// Wait for a free session slot; hold the permit while the child runs.
    async fn session(&self) -> Result<SemaphorePermit<'_>> {
        self.sessions
            .acquire()
            .await
            .map_err(|_| eyre!("ssh session pool closed"))
    }

    fn remote_command(&self, command: &str) -> Command {
        let mut cmd = self.ssh();
        cmd.arg(self.config.destination()).arg(command);
        cmd
    }

    /// Execute a command on the remote host
    ///
    /// # Errors
    /// Returns an error if `ssh` cannot be run.
    pub async fn execute(&self, command: &str) -> Result<(String, String, i32)> {
        let _session = self.session().await?;
        trace!("ssh {}: {command}", self.config.destination());
        let output = self
            .remote_command(command)
            .stdin(Stdio::null())
            .output()
            .await
            .wrap_err("failed to run ssh")?;

        Ok((
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
            output.status.code().unwrap_or(-1),
        ))
    }

    /// Execute a command and fail on a non-zero exit status
    async fn run(&self, command: &str) -> Result<String> {
        let (stdout, stderr, code) = self.execute(command).await?;
        if code != 0 {
            bail!("`{command}` exited with {code}: {}", stderr.trim());
        }
        Ok(stdout)
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn list(&self, remote_base: &str) -> Result<Snapshot> {
        let stdout = self.run(&listing_command(remote_base)).await?;
        Ok(Snapshot::parse_listing(&stdout))
    }

    async fn create_dir_all(&self, dir: &str) -> Result<()> {
        self.run(&format!("mkdir -p {}", remote_path_arg(dir))).await?;
        Ok(())
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<u64> {
        let mut file = tokio::fs::File::open(local_path)
            .await
            .wrap_err_with(|| format!("failed to open {}", local_path.display()))?;

        let _session = self.session().await?;
        let mut child = self
            .remote_command(&format!("cat > {}", remote_path_arg(remote_path)))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .wrap_err("failed to run ssh")?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| eyre!("ssh stdin not captured"))?;
        let copied = tokio::io::copy(&mut file, &mut stdin).await;
        // EOF on stdin ends `cat` on the remote side.
        let _ = stdin.shutdown().await;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            bail!(
                "upload to {remote_path} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let bytes = copied.wrap_err_with(|| format!("failed to stream {}", local_path.display()))?;
        Ok(bytes)
    }

    async fn set_mtime(&self, remote_path: &str, mod_time: i64) -> Result<()> {
        self.run(&format!("touch -m -d @{mod_time} {}", remote_path_arg(remote_path)))
            .await?;
        Ok(())
    }

    async fn symlink(&self, target: &str, remote_path: &str) -> Result<()> {
        let command = format!(
            "ln -sfn {} {}",
            quote(target),
            remote_path_arg(remote_path)
        );
        self.run(&command).await?;
        Ok(())
    }

    async fn remove(&self, remote_path: &str) -> Result<()> {
        self.run(&format!("rm -f {}", remote_path_arg(remote_path))).await?;
        Ok(())
    }
}

/// Remote command producing the listing parsed by [`Snapshot::parse_listing`]
#[must_use]
pub fn listing_command(remote_base: &str) -> String {
    format!(
        "cd {} && find . -type f -printf '%P %s %T@\\n'",
        remote_path_arg(remote_base)
    )
}

/// Quote a remote path, keeping a leading `~` as the remote user's home
#[must_use]
pub fn remote_path_arg(path: &str) -> String {
    match path.strip_prefix('~') {
        Some("") => "\"$HOME\"".to_string(),
        Some(rest) if rest.starts_with('/') => format!("\"$HOME\"{}", quote(rest)),
        _ => quote(path),
    }
}

/// Quote `arg` for a POSIX shell
#[must_use]
pub fn quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}
