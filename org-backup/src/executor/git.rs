//! Git transport: bare mirror clones and incremental mirror updates.

use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

const MAX_STDERR: usize = 400;

#[async_trait]
pub trait GitTransport: Send + Sync {
    /// `git clone --mirror url dest`
    async fn mirror_clone(&self, url: &str, dest: &Path, timeout: Duration) -> Result<()>;

    /// `git fetch --prune` inside an existing bare mirror
    async fn update_mirror(&self, dir: &Path, timeout: Duration) -> Result<()>;

    /// Whether `dir` holds a bare repository that can be fetched into.
    async fn is_valid_mirror(&self, dir: &Path) -> bool;
}

/// Runs the `git` binary. The access token is handed over through git's
/// environment configuration as an HTTP header, so it never appears in argv
/// or in the mirror's stored config.
pub struct GitCli {
    binary: PathBuf,
    auth_header: String,
}

impl GitCli {
    pub fn new(token: &str) -> Self {
        let basic = STANDARD.encode(format!("x-access-token:{}", token));
        Self {
            binary: PathBuf::from("git"),
            auth_header: format!("Authorization: Basic {}", basic),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    fn command(&self, cwd: Option<&Path>) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        cmd.env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_CONFIG_COUNT", "1")
            .env("GIT_CONFIG_KEY_0", "http.extraHeader")
            .env("GIT_CONFIG_VALUE_0", &self.auth_header)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, mut cmd: Command, what: &str, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return Err(BackupError::Timeout(timeout));
        }
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| BackupError::Timeout(timeout))?
            .map_err(|e| BackupError::Git(format!("cannot run git: {}", e)))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify_failure(what, &stderr))
    }
}

/// Map git's stderr to the error taxonomy. A missing remote (typically a
/// wiki that was never created) is `NotFound`.
fn classify_failure(what: &str, stderr: &str) -> BackupError {
    let lower = stderr.to_lowercase();
    let detail: String = stderr.trim().chars().take(MAX_STDERR).collect();
    if lower.contains("not found") || lower.contains("does not appear to be a git repository") {
        BackupError::NotFound(format!("{}: {}", what, detail))
    } else {
        BackupError::Git(format!("{} failed: {}", what, detail))
    }
}

#[async_trait]
impl GitTransport for GitCli {
    async fn mirror_clone(&self, url: &str, dest: &Path, timeout: Duration) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        debug!(url, dest = %dest.display(), "git clone --mirror");
        let mut cmd = self.command(None);
        cmd.arg("clone").arg("--mirror").arg("--quiet").arg(url).arg(dest);
        self.run(cmd, "git clone --mirror", timeout).await
    }

    async fn update_mirror(&self, dir: &Path, timeout: Duration) -> Result<()> {
        debug!(dir = %dir.display(), "git fetch --prune");
        let mut cmd = self.command(Some(dir));
        cmd.args(["fetch", "--prune", "--quiet", "origin"]);
        self.run(cmd, "git fetch", timeout).await
    }

    async fn is_valid_mirror(&self, dir: &Path) -> bool {
        if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
            return false;
        }
        let mut cmd = self.command(Some(dir));
        cmd.args(["rev-parse", "--is-bare-repository"]).stdout(Stdio::piped());
        match tokio::time::timeout(Duration::from_secs(10), cmd.output()).await {
            Ok(Ok(output)) => {
                output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "true"
            }
            _ => false,
        }
    }
}
