//! Process management utilities.
//!
//! Liveness probes, signalling and reaping for the helper processes a
//! machine runs on (hypervisor helper, network proxy, command proxy), plus
//! the [`ProcessRegistry`] that tracks them for the lifetime of a `start`.

use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Default timeout for graceful shutdown before SIGKILL.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for SIGKILL to take effect.
pub const SIGKILL_WAIT: Duration = Duration::from_millis(500);

/// Check if a process is alive.
///
/// Returns true if the process exists and is running. Zombies of our own
/// children count as alive until reaped, see [`try_wait`].
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // EPERM: exists but owned by someone else.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Check if a process is alive.
#[cfg(not(unix))]
pub fn is_alive(pid: u32) -> bool {
    use sysinfo::{Pid, ProcessesToUpdate, System};
    if pid == 0 {
        return false;
    }
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).is_some()
}

/// Reap a child without blocking.
///
/// Returns `Some(exit_code)` if the child has exited, `None` if it is still
/// running or is not a child of this process.
#[cfg(unix)]
pub fn try_wait(pid: u32) -> Option<i32> {
    let pid = libc::pid_t::try_from(pid).ok()?;
    let mut status: libc::c_int = 0;
    let result = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };

    if result == pid {
        Some(decode_status(status))
    } else {
        None
    }
}

/// Reap a child without blocking.
#[cfg(not(unix))]
pub fn try_wait(_pid: u32) -> Option<i32> {
    None
}

#[cfg(unix)]
fn decode_status(status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        -1
    }
}

/// Send SIGTERM to a process.
///
/// Returns true if the signal was sent successfully.
#[cfg(unix)]
pub fn terminate(pid: u32) -> bool {
    match libc::pid_t::try_from(pid) {
        Ok(pid) if pid > 0 => unsafe { libc::kill(pid, libc::SIGTERM) == 0 },
        _ => false,
    }
}

/// Ask a process to exit. Windows has no SIGTERM; this kills.
#[cfg(not(unix))]
pub fn terminate(pid: u32) -> bool {
    kill(pid)
}

/// Send SIGKILL to a process.
///
/// Returns true if the signal was sent successfully.
#[cfg(unix)]
pub fn kill(pid: u32) -> bool {
    match libc::pid_t::try_from(pid) {
        Ok(pid) if pid > 0 => unsafe { libc::kill(pid, libc::SIGKILL) == 0 },
        _ => false,
    }
}

/// Forcibly terminate a process.
#[cfg(not(unix))]
pub fn kill(pid: u32) -> bool {
    use sysinfo::{Pid, ProcessesToUpdate, System};
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).map(|p| p.kill()).unwrap_or(false)
}

/// Pid of the process that launched us.
#[cfg(unix)]
pub fn parent_pid() -> u32 {
    std::os::unix::process::parent_id()
}

/// Pid of the process that launched us.
#[cfg(not(unix))]
pub fn parent_pid() -> u32 {
    use sysinfo::{Pid, ProcessesToUpdate, System};
    let me = Pid::from_u32(std::process::id());
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[me]), true);
    sys.process(me)
        .and_then(|p| p.parent())
        .map(|p| p.as_u32())
        .unwrap_or(0)
}

/// True only if every pid in the group is alive.
///
/// An empty group is considered alive.
pub fn is_group_alive(pids: &[u32]) -> bool {
    pids.iter().all(|&pid| is_alive(pid))
}

/// Fail with [`Error::ParentDead`] if the supervising parent is gone.
pub fn ensure_parent_alive(ppid: u32) -> Result<()> {
    if is_alive(ppid) {
        Ok(())
    } else {
        Err(Error::ParentDead(ppid))
    }
}

/// Gracefully stop a process.
///
/// 1. Sends SIGTERM
/// 2. Waits up to `timeout` for graceful exit
/// 3. If still running and `force` is true, sends SIGKILL
///
/// Works for children (reaped) and unrelated processes (polled).
pub fn stop_process(pid: u32, timeout: Duration, force: bool) -> Result<i32> {
    if let Some(code) = try_wait(pid) {
        return Ok(code);
    }
    if !is_alive(pid) {
        return Ok(0);
    }

    if !terminate(pid) {
        return Ok(try_wait(pid).unwrap_or(0));
    }

    let start = Instant::now();
    let poll_interval = Duration::from_millis(100);

    while start.elapsed() < timeout {
        if let Some(code) = try_wait(pid) {
            return Ok(code);
        }
        if !is_alive(pid) {
            return Ok(0);
        }
        std::thread::sleep(poll_interval);
    }

    if force {
        tracing::debug!(pid, "SIGTERM timeout, sending SIGKILL");
        kill(pid);
        let deadline = Instant::now() + SIGKILL_WAIT;
        while Instant::now() < deadline {
            if let Some(code) = try_wait(pid) {
                return Ok(code);
            }
            if !is_alive(pid) {
                return Ok(0);
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        Ok(try_wait(pid).unwrap_or(-1))
    } else {
        Err(Error::Timeout(format!(
            "waiting for process {} to stop",
            pid
        )))
    }
}

/// Read a pid file. Missing or malformed files yield `None`.
pub fn read_pid_file(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// Write a pid file atomically.
pub fn write_pid_file(path: &Path, pid: u32) -> Result<()> {
    crate::util::write_atomic(path, format!("{}\n", pid).as_bytes())
}

/// A handle to a running child process.
///
/// Provides methods to check status, stop, and kill the process.
#[derive(Debug)]
pub struct ChildProcess {
    pid: u32,
    exit_code: Option<i32>,
}

impl ChildProcess {
    /// Create a new child process handle.
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            exit_code: None,
        }
    }

    /// Get the process ID.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Check if the process is still running.
    pub fn is_running(&mut self) -> bool {
        if self.exit_code.is_some() {
            return false;
        }

        if let Some(code) = try_wait(self.pid) {
            self.exit_code = Some(code);
            false
        } else {
            is_alive(self.pid)
        }
    }

    /// Get the exit code if the process has exited.
    pub fn exit_code(&mut self) -> Option<i32> {
        if self.exit_code.is_none() {
            self.exit_code = try_wait(self.pid);
        }
        self.exit_code
    }

    /// Gracefully stop the process.
    ///
    /// Sends SIGTERM, waits for `timeout`, then SIGKILL if `force` is true.
    pub fn stop(&mut self, timeout: Duration, force: bool) -> Result<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }

        let code = stop_process(self.pid, timeout, force)?;
        self.exit_code = Some(code);
        Ok(code)
    }
}

/// Role of a tracked helper process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessRole {
    /// The process that launched this invocation.
    Parent,
    /// krunkit / vfkit / wsl.exe.
    Hypervisor,
    /// gvproxy.
    NetworkProxy,
    /// The SSH command proxy.
    CommandProxy,
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessRole::Parent => write!(f, "parent"),
            ProcessRole::Hypervisor => write!(f, "hypervisor helper"),
            ProcessRole::NetworkProxy => write!(f, "network proxy"),
            ProcessRole::CommandProxy => write!(f, "command proxy"),
        }
    }
}

/// Helper processes started by this invocation.
///
/// Owned by the top-level command and shared with the orchestrator and the
/// watchdog. Everything registered here is killed on exit.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    inner: Mutex<Tracked>,
}

#[derive(Debug, Default)]
struct Tracked {
    hypervisor: Option<ChildProcess>,
    network_proxy: Option<ChildProcess>,
    command_proxy: Option<ChildProcess>,
}

impl Tracked {
    fn slot(&mut self, role: ProcessRole) -> Option<&mut Option<ChildProcess>> {
        match role {
            ProcessRole::Parent => None,
            ProcessRole::Hypervisor => Some(&mut self.hypervisor),
            ProcessRole::NetworkProxy => Some(&mut self.network_proxy),
            ProcessRole::CommandProxy => Some(&mut self.command_proxy),
        }
    }
}

impl ProcessRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `pid` under `role`, replacing any previous entry.
    pub fn register(&self, role: ProcessRole, pid: u32) {
        let mut tracked = self.inner.lock();
        if let Some(slot) = tracked.slot(role) {
            tracing::debug!(role = %role, pid, "tracking process");
            *slot = Some(ChildProcess::new(pid));
        }
    }

    /// Pid tracked under `role`.
    pub fn pid(&self, role: ProcessRole) -> Option<u32> {
        let mut tracked = self.inner.lock();
        tracked
            .slot(role)
            .and_then(|slot| slot.as_ref().map(|c| c.pid()))
    }

    /// Liveness of the process under `role`; `None` if nothing is tracked.
    ///
    /// Returns the exit code when it has exited and was reaped.
    pub fn check(&self, role: ProcessRole) -> Option<ProcessStatus> {
        let mut tracked = self.inner.lock();
        let child = tracked.slot(role)?.as_mut()?;
        if child.is_running() {
            Some(ProcessStatus::Running)
        } else {
            Some(ProcessStatus::Exited(child.exit_code()))
        }
    }

    /// Kill the hypervisor helper, network proxy and command proxy.
    ///
    /// Safe to call repeatedly.
    pub fn kill_all(&self, timeout: Duration) {
        let mut tracked = self.inner.lock();
        for role in [
            ProcessRole::Hypervisor,
            ProcessRole::NetworkProxy,
            ProcessRole::CommandProxy,
        ] {
            if let Some(Some(child)) = tracked.slot(role) {
                match child.stop(timeout, true) {
                    Ok(code) => tracing::debug!(role = %role, pid = child.pid(), code, "process stopped"),
                    Err(e) => tracing::warn!(role = %role, pid = child.pid(), error = %e, "failed to stop process"),
                }
            }
        }
    }
}

/// Observed state of a tracked process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Still running.
    Running,
    /// Gone; exit code if we reaped it.
    Exited(Option<i32>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_alive_self() {
        // Current process should be alive
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn test_is_alive_nonexistent() {
        // PID 99999999 is unlikely to exist
        assert!(!is_alive(99_999_999));
        assert!(!is_alive(0));
    }

    #[test]
    fn test_group_alive_any_dead_means_dead() {
        let me = std::process::id();
        assert!(is_group_alive(&[]));
        assert!(is_group_alive(&[me]));
        assert!(!is_group_alive(&[me, 99_999_999]));
    }

    #[test]
    fn test_parent_alive() {
        ensure_parent_alive(parent_pid()).unwrap();
        assert!(matches!(
            ensure_parent_alive(99_999_999),
            Err(Error::ParentDead(99_999_999))
        ));
    }

    #[test]
    fn test_pid_file_roundtrip() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("x.pid");
        assert_eq!(read_pid_file(&path), None);
        write_pid_file(&path, 4242).unwrap();
        assert_eq!(read_pid_file(&path), Some(4242));
        std::fs::write(&path, "garbage").unwrap();
        assert_eq!(read_pid_file(&path), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_registry_kill_all_reaps_children() {
        let child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();

        let registry = ProcessRegistry::new();
        registry.register(ProcessRole::NetworkProxy, pid);
        registry.register(ProcessRole::Parent, 1);
        assert_eq!(registry.pid(ProcessRole::NetworkProxy), Some(pid));
        assert_eq!(registry.pid(ProcessRole::Parent), None);
        assert_eq!(registry.check(ProcessRole::NetworkProxy), Some(ProcessStatus::Running));
        assert_eq!(registry.check(ProcessRole::Hypervisor), None);

        registry.kill_all(Duration::from_millis(200));
        assert!(!is_alive(pid));
        assert!(matches!(
            registry.check(ProcessRole::NetworkProxy),
            Some(ProcessStatus::Exited(_))
        ));
        registry.kill_all(Duration::from_millis(200));
    }

    #[cfg(unix)]
    #[test]
    fn test_child_exit_code_is_reaped() {
        let child = std::process::Command::new("sh")
            .args(["-c", "exit 3"])
            .spawn()
            .unwrap();
        let mut handle = ChildProcess::new(child.id());
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(handle.exit_code(), Some(3));
    }
}
