//! Running commands in the guest over SSH.
//!
//! Used for the command proxy and for best-effort housekeeping around a
//! start (clock sync after boot, filesystem sync before a forced stop).

use crate::error::{Error, Result};
use crate::machine::MachineConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Default budget for a housekeeping command.
pub const HOUSEKEEPING_TIMEOUT: Duration = Duration::from_secs(10);

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    /// Host; always loopback for forwarded guests.
    pub host: String,
    /// Forwarded port.
    pub port: u16,
    /// Guest user.
    pub user: String,
    /// Private key.
    pub identity: PathBuf,
}

impl SshTarget {
    /// Target for a machine's forwarded SSH port.
    pub fn for_machine(mc: &MachineConfig) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: mc.ssh.port,
            user: mc.ssh.remote_username.clone(),
            identity: mc.ssh.identity_path.path().to_path_buf(),
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Result of a remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; -1 when terminated by a signal.
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

/// Run `cmd` through `sh -c` in the guest.
///
/// A non-zero exit status is reported in the output, not as an error.
#[cfg(unix)]
pub async fn run(target: &SshTarget, cmd: &str, timeout: Duration) -> Result<CommandOutput> {
    use openssh::{KnownHosts, SessionBuilder};

    let dest = target.destination();
    let mut builder = SessionBuilder::default();
    builder
        .connect_timeout(timeout)
        .known_hosts_check(KnownHosts::Accept)
        .port(target.port)
        .keyfile(&target.identity);

    let session = tokio::time::timeout(timeout, builder.connect(&dest))
        .await
        .map_err(|_| Error::Timeout(format!("connecting to {}:{}", dest, target.port)))?
        .map_err(|e| Error::ssh(format!("connect to {}", dest), e.to_string()))?;

    tracing::debug!(dest = %dest, port = target.port, cmd, "running remote command");
    let output = tokio::time::timeout(
        timeout,
        session.command("sh").arg("-c").arg(cmd).output(),
    )
    .await
    .map_err(|_| Error::Timeout(format!("running '{}' in the guest", cmd)))?
    .map_err(|e| Error::ssh("exec", e.to_string()))?;

    if let Err(e) = session.close().await {
        tracing::debug!(error = %e, "ssh session close failed");
    }
    Ok(output.into())
}

/// Run `cmd` through `sh -c` in the guest using the system `ssh` client.
#[cfg(not(unix))]
pub async fn run(target: &SshTarget, cmd: &str, timeout: Duration) -> Result<CommandOutput> {
    let dest = target.destination();
    let mut command = tokio::process::Command::new("ssh");
    command
        .arg("-i")
        .arg(&target.identity)
        .arg("-p")
        .arg(target.port.to_string())
        .args([
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=NUL",
            "-o",
            "BatchMode=yes",
            "-o",
        ])
        .arg(format!("ConnectTimeout={}", timeout.as_secs().max(1)))
        .arg(&dest)
        .arg("sh")
        .arg("-c")
        .arg(shell_quote(cmd))
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);

    tracing::debug!(dest = %dest, port = target.port, cmd, "running remote command");
    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| Error::Timeout(format!("running '{}' in the guest", cmd)))?
        .map_err(|e| Error::ssh("spawn ssh", e.to_string()))?;
    Ok(output.into())
}

/// Single-quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'\''"#))
}

fn check(output: CommandOutput, what: &str) -> Result<()> {
    if output.exit_code == 0 {
        Ok(())
    } else {
        Err(Error::ssh(
            what,
            format!("exit code {}: {}", output.exit_code, output.stderr.trim()),
        ))
    }
}

/// Flush guest filesystem buffers.
pub async fn sync_filesystems(target: &SshTarget) -> Result<()> {
    check(run(target, "sync", HOUSEKEEPING_TIMEOUT).await?, "sync")
}

/// Set the guest clock to the host's.
pub async fn sync_clock(target: &SshTarget) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let cmd = clock_command(now);
    check(run(target, &cmd, HOUSEKEEPING_TIMEOUT).await?, "clock sync")
}

fn clock_command(epoch_secs: i64) -> String {
    format!("date -u -s @{} >/dev/null", epoch_secs)
}
