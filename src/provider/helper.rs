//! Launching and stopping vfkit-style hypervisor helpers.
//!
//! krunkit and vfkit share a command-line dialect (`--cpus`, `--memory`,
//! `--device virtio-*`), so both providers build their launch command and
//! track the helper process here.

use crate::error::{Error, Result};
use crate::machine::{HelperConfig, HypervisorConfig, MachineConfig, MachineState};
use crate::process::{self, ProcessRegistry, ProcessRole, DEFAULT_STOP_TIMEOUT, SIGKILL_WAIT};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Fixed guest MAC; gvproxy hands out the guest IP by MAC.
pub const GUEST_MAC: &str = "5a:94:ef:e4:0c:ee";

/// vsock port the guest connects to when it has booted.
pub const READY_VSOCK_PORT: u32 = 1025;

/// Which helper dialect to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperKind {
    /// krunkit (libkrun).
    Krunkit,
    /// vfkit (Virtualization.framework); needs an EFI bootloader.
    Vfkit,
}

/// A helper command line under construction.
#[derive(Debug, Clone)]
pub struct HelperCommand {
    binary: PathBuf,
    args: Vec<String>,
}

impl HelperCommand {
    /// Start a command for `binary`.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
        }
    }

    /// Full launch command for a machine.
    pub fn for_machine(kind: HelperKind, binary: &Path, mc: &MachineConfig) -> Result<Self> {
        let helper = helper_config(mc)?;
        let mut cmd = Self::new(binary);

        cmd.arg("--cpus", mc.resources.cpus.to_string());
        cmd.arg("--memory", mc.resources.memory.to_string());

        if kind == HelperKind::Vfkit {
            let store = helper.efi_variable_store.as_ref().ok_or_else(|| {
                Error::provider("build vfkit command", "no EFI variable store configured")
            })?;
            cmd.arg(
                "--bootloader",
                format!("efi,variable-store={},create", store.path().display()),
            );
        }

        cmd.device(format!("virtio-blk,path={}", mc.image_path.path().display()));
        if let Some(data) = &mc.image.data_disk_path {
            cmd.device(format!("virtio-blk,path={}", data.path().display()));
        }
        cmd.device(format!(
            "virtio-net,unixSocketPath={},mac={}",
            helper.network_socket.path().display(),
            GUEST_MAC
        ));
        cmd.device(format!(
            "virtio-vsock,port={},socketURL={},connect",
            READY_VSOCK_PORT,
            helper.ready_socket.path().display()
        ));
        for mount in &mc.mounts {
            cmd.device(format!(
                "virtio-fs,sharedDir={},mountTag={}",
                mount.source, mount.tag
            ));
        }
        cmd.device(format!(
            "virtio-serial,logFilePath={}",
            helper.log_file.path().display()
        ));
        cmd.device("virtio-rng");

        Ok(cmd)
    }

    /// Append `flag value`.
    pub fn arg(&mut self, flag: &str, value: impl Into<String>) -> &mut Self {
        self.args.push(flag.to_string());
        self.args.push(value.into());
        self
    }

    /// Append `--device spec`.
    pub fn device(&mut self, spec: impl Into<String>) -> &mut Self {
        self.arg("--device", spec)
    }

    /// Arguments so far.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Helper binary.
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// A detached [`Command`] with stdio redirected away from the terminal.
    pub fn build(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        detach(&mut cmd);
        cmd
    }
}

/// Put a child in its own process group so terminal signals reach only us.
#[cfg(unix)]
pub(crate) fn detach(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
pub(crate) fn detach(_cmd: &mut Command) {}

/// The helper section of a krunkit/vfkit machine.
pub fn helper_config(mc: &MachineConfig) -> Result<&HelperConfig> {
    match &mc.hypervisor {
        HypervisorConfig::LibKrun(h) | HypervisorConfig::AppleHv(h) => Ok(h),
        HypervisorConfig::Wsl(_) => Err(Error::provider(
            "load helper config",
            format!("machine '{}' is a WSL machine", mc.name),
        )),
    }
}

/// Spawn the helper, record its pid file and register it.
///
/// The ready socket is owned by the caller, which must be listening on it
/// before the helper starts.
pub fn launch(cmd: &HelperCommand, mc: &MachineConfig, registry: &ProcessRegistry) -> Result<u32> {
    let helper = helper_config(mc)?;

    tracing::debug!(
        machine = %mc.name,
        binary = %cmd.binary().display(),
        args = ?cmd.args(),
        "launching hypervisor helper"
    );

    let child = cmd.build().spawn().map_err(|e| {
        Error::provider(
            format!("spawn {}", cmd.binary().display()),
            e.to_string(),
        )
    })?;
    let pid = child.id();
    registry.register(ProcessRole::Hypervisor, pid);
    process::write_pid_file(helper.pid_file.path(), pid)?;

    tracing::info!(machine = %mc.name, pid, "hypervisor helper started");
    Ok(pid)
}

/// State from the helper pid file.
pub fn state(mc: &MachineConfig) -> Result<MachineState> {
    let helper = helper_config(mc)?;
    match process::read_pid_file(helper.pid_file.path()) {
        Some(pid) if process::is_alive(pid) => Ok(if mc.starting {
            MachineState::Starting
        } else {
            MachineState::Running
        }),
        _ => Ok(MachineState::Stopped),
    }
}

/// Stop the helper named by the pid file. Already stopped is fine.
pub fn stop(mc: &MachineConfig, hard_stop: bool) -> Result<()> {
    let helper = helper_config(mc)?;
    let Some(pid) = process::read_pid_file(helper.pid_file.path()) else {
        tracing::debug!(machine = %mc.name, "no helper pid file, nothing to stop");
        return Ok(());
    };
    // A helper exit without its pid file is a requested stop.
    helper.pid_file.delete_if_exists()?;

    if process::is_alive(pid) {
        if hard_stop {
            process::kill(pid);
            process::stop_process(pid, SIGKILL_WAIT, true)?;
        } else {
            process::stop_process(pid, DEFAULT_STOP_TIMEOUT, true)?;
        }
        tracing::info!(machine = %mc.name, pid, hard_stop, "hypervisor helper stopped");
    }

    helper.ready_socket.delete_if_exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{InitOptions, Mount, MountType, VmType};
    use crate::paths::OvmPaths;
    use crate::vmfile::VmFile;

    fn machine(root: &Path, efi: bool) -> MachineConfig {
        let dirs = OvmPaths::with_root(root).machine_dirs(VmType::AppleHv);
        let helper = HelperConfig {
            pid_file: dirs.runtime_dir.append("vm1-helper.pid"),
            log_file: dirs.runtime_dir.append("vm1.log"),
            ready_socket: dirs.runtime_dir.append("vm1-ready.sock"),
            network_socket: dirs.runtime_dir.append("vm1-net.sock"),
            efi_variable_store: efi.then(|| dirs.data_dir.append("vm1-efi")),
        };
        let opts = InitOptions {
            name: "vm1".into(),
            cpus: 4,
            memory: 4096,
            disk_size: 10,
            ..Default::default()
        };
        let mounts = vec![Mount {
            source: "/Users/me/src".into(),
            target: "/src".into(),
            tag: "/src".into(),
            mount_type: MountType::VirtioFs,
            read_only: false,
        }];
        MachineConfig::new(
            &opts,
            &dirs,
            HypervisorConfig::AppleHv(helper),
            VmFile::new("/id"),
            mounts,
        )
    }

    fn has_pair(args: &[String], flag: &str, value_prefix: &str) -> bool {
        args.windows(2)
            .any(|w| w[0] == flag && w[1].starts_with(value_prefix))
    }

    #[test]
    fn test_vfkit_command() {
        let temp = tempfile::tempdir().unwrap();
        let mc = machine(temp.path(), true);
        let cmd = HelperCommand::for_machine(HelperKind::Vfkit, Path::new("vfkit"), &mc).unwrap();
        let args = cmd.args();

        assert!(has_pair(args, "--cpus", "4"));
        assert!(has_pair(args, "--memory", "4096"));
        assert!(has_pair(args, "--bootloader", "efi,variable-store="));
        assert!(has_pair(args, "--device", "virtio-blk,path="));
        assert!(has_pair(args, "--device", "virtio-net,unixSocketPath="));
        assert!(has_pair(args, "--device", "virtio-vsock,port=1025,"));
        assert!(has_pair(args, "--device", "virtio-fs,sharedDir=/Users/me/src,mountTag=/src"));
    }

    #[test]
    fn test_krunkit_has_no_bootloader() {
        let temp = tempfile::tempdir().unwrap();
        let mc = machine(temp.path(), false);
        let cmd =
            HelperCommand::for_machine(HelperKind::Krunkit, Path::new("krunkit"), &mc).unwrap();
        assert!(!cmd.args().iter().any(|a| a == "--bootloader"));
    }

    #[test]
    fn test_vfkit_requires_efi_store() {
        let temp = tempfile::tempdir().unwrap();
        let mc = machine(temp.path(), false);
        assert!(HelperCommand::for_machine(HelperKind::Vfkit, Path::new("vfkit"), &mc).is_err());
    }

    #[test]
    fn test_state_from_pid_file() {
        let temp = tempfile::tempdir().unwrap();
        let mut mc = machine(temp.path(), false);
        mc.dirs.create_all().unwrap();
        assert_eq!(state(&mc).unwrap(), MachineState::Stopped);

        let pid_file = helper_config(&mc).unwrap().pid_file.clone();
        process::write_pid_file(pid_file.path(), std::process::id()).unwrap();
        assert_eq!(state(&mc).unwrap(), MachineState::Running);
        mc.starting = true;
        assert_eq!(state(&mc).unwrap(), MachineState::Starting);

        process::write_pid_file(pid_file.path(), 99_999_999).unwrap();
        assert_eq!(state(&mc).unwrap(), MachineState::Stopped);
    }

    #[cfg(unix)]
    #[test]
    fn test_launch_and_stop() {
        let temp = tempfile::tempdir().unwrap();
        let mc = machine(temp.path(), false);
        mc.dirs.create_all().unwrap();

        let mut cmd = HelperCommand::new("sleep");
        cmd.args.push("30".into());
        let registry = ProcessRegistry::new();
        let pid = launch(&cmd, &mc, &registry).unwrap();

        assert_eq!(registry.pid(ProcessRole::Hypervisor), Some(pid));
        assert_eq!(state(&mc).unwrap(), MachineState::Running);

        stop(&mc, false).unwrap();
        assert_eq!(state(&mc).unwrap(), MachineState::Stopped);
        assert!(!helper_config(&mc).unwrap().pid_file.exists());
        stop(&mc, true).unwrap();
    }
}
