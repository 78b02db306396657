//! WSL2 provider.
//!
//! Machines are WSL distributions named `ovm-{name}`, imported from a
//! rootfs image. WSL manages its own networking, so no network proxy is
//! started; SSH listens directly on the forwarded localhost port.

use super::helper::detach;
use super::libkrun::place_image;
use super::VmProvider;
use crate::error::{Error, Result};
use crate::machine::{
    HypervisorConfig, InitOptions, MachineConfig, MachineState, MountType, SetOptions, VmType,
    WslConfig,
};
use crate::network::GvproxyCommand;
use crate::paths::MachineDirs;
use crate::process::{self, ProcessRegistry, ProcessRole};
use std::path::Path;
use std::process::{Command, Stdio};

const WSL_EXE: &str = "wsl.exe";

/// sshd drop-in that carries the forwarded port.
const SSHD_DROP_IN: &str = "/etc/ssh/sshd_config.d/ovm.conf";

/// WSL-backed machines.
#[derive(Debug, Clone)]
pub struct WslProvider {
    dirs: MachineDirs,
}

impl WslProvider {
    /// Provider over the wsl directory set.
    pub fn new(dirs: MachineDirs) -> Self {
        Self { dirs }
    }
}

/// Distribution name for a machine.
pub fn distribution_name(machine: &str) -> String {
    format!("ovm-{}", machine)
}

fn wsl_config(mc: &MachineConfig) -> Result<&WslConfig> {
    match &mc.hypervisor {
        HypervisorConfig::Wsl(w) => Ok(w),
        _ => Err(Error::provider(
            "load wsl config",
            format!("machine '{}' is not a WSL machine", mc.name),
        )),
    }
}

/// Run `wsl.exe` to completion and return decoded stdout.
fn wsl(args: &[&str]) -> Result<String> {
    tracing::debug!(?args, "running wsl.exe");
    let output = Command::new(WSL_EXE)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| Error::provider("run wsl.exe", e.to_string()))?;
    let stdout = decode_output(&output.stdout);
    if !output.status.success() {
        let stderr = decode_output(&output.stderr);
        let detail = if stderr.trim().is_empty() { stdout } else { stderr };
        return Err(Error::provider(
            format!("wsl.exe {}", args.join(" ")),
            detail.trim().to_string(),
        ));
    }
    Ok(stdout)
}

/// wsl.exe writes UTF-16LE to pipes; commands run inside a distro write UTF-8.
pub fn decode_output(bytes: &[u8]) -> String {
    let looks_utf16 = bytes.len() >= 2
        && bytes.len() % 2 == 0
        && bytes.iter().skip(1).step_by(2).filter(|&&b| b == 0).count() * 2 >= bytes.len() / 2;
    if looks_utf16 {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16_lossy(&units)
            .trim_start_matches('\u{feff}')
            .to_string()
    } else {
        String::from_utf8_lossy(bytes).to_string()
    }
}

fn distro_listed(listing: &str, distro: &str) -> bool {
    listing
        .lines()
        .map(|l| l.trim().trim_matches('\0'))
        .any(|l| l == distro)
}

fn is_registered(distro: &str) -> Result<bool> {
    Ok(distro_listed(&wsl(&["--list", "--quiet"])?, distro))
}

fn is_running(distro: &str) -> Result<bool> {
    Ok(distro_listed(&wsl(&["--list", "--running", "--quiet"])?, distro))
}

fn run_in_distro(distro: &str, script: &str) -> Result<String> {
    wsl(&["-d", distro, "-u", "root", "--exec", "/bin/sh", "-c", script])
}

impl VmProvider for WslProvider {
    fn vm_type(&self) -> VmType {
        VmType::Wsl
    }

    fn exists(&self, name: &str) -> Result<bool> {
        is_running(&distribution_name(name))
    }

    fn mount_type(&self) -> MountType {
        MountType::Wsl
    }

    fn hypervisor_config(&self, name: &str, dirs: &MachineDirs) -> HypervisorConfig {
        HypervisorConfig::Wsl(WslConfig {
            distribution: distribution_name(name),
            install_dir: dirs.data_dir.append(format!("{}-wsl", name)),
            pid_file: dirs.runtime_dir.append(format!("{}-wsl.pid", name)),
        })
    }

    fn get_disk(
        &self,
        user_input: Option<&Path>,
        _dirs: &MachineDirs,
        mc: &MachineConfig,
    ) -> Result<()> {
        place_image(user_input, mc)
    }

    fn create_vm(&self, _opts: &InitOptions, mc: &mut MachineConfig) -> Result<()> {
        let cfg = wsl_config(mc)?.clone();
        if is_registered(&cfg.distribution)? {
            tracing::info!(distro = %cfg.distribution, "unregistering previous distribution");
            wsl(&["--unregister", &cfg.distribution])?;
        }
        cfg.install_dir.create_path()?;

        let install_dir = cfg.install_dir.abs_path()?;
        let image = mc.image_path.abs_path()?;
        wsl(&[
            "--import",
            &cfg.distribution,
            &install_dir.to_string_lossy(),
            &image.to_string_lossy(),
            "--version",
            "2",
        ])?;
        tracing::info!(distro = %cfg.distribution, "distribution imported");
        Ok(())
    }

    fn start_vm(&self, mc: &MachineConfig, registry: &ProcessRegistry) -> Result<u32> {
        let cfg = wsl_config(mc)?;
        let mut cmd = Command::new(WSL_EXE);
        cmd.args([
            "-d",
            cfg.distribution.as_str(),
            "-u",
            "root",
            "--exec",
            "/bin/sh",
            "-c",
            "/usr/sbin/sshd; exec sleep infinity",
        ]);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        detach(&mut cmd);

        let child = cmd
            .spawn()
            .map_err(|e| Error::provider("start wsl distribution", e.to_string()))?;
        let pid = child.id();
        registry.register(ProcessRole::Hypervisor, pid);
        process::write_pid_file(cfg.pid_file.path(), pid)?;
        tracing::info!(machine = %mc.name, distro = %cfg.distribution, pid, "distribution started");
        Ok(pid)
    }

    fn stop_vm(&self, mc: &MachineConfig, hard_stop: bool) -> Result<()> {
        let cfg = wsl_config(mc)?;
        let pid = process::read_pid_file(cfg.pid_file.path());
        cfg.pid_file.delete_if_exists()?;
        if is_running(&cfg.distribution)? {
            wsl(&["--terminate", &cfg.distribution])?;
        }
        if let Some(pid) = pid {
            if hard_stop {
                process::kill(pid);
            } else {
                process::stop_process(pid, process::DEFAULT_STOP_TIMEOUT, true)?;
            }
        }
        Ok(())
    }

    fn state(&self, mc: &MachineConfig) -> Result<MachineState> {
        let cfg = wsl_config(mc)?;
        if !is_running(&cfg.distribution)? {
            return Ok(MachineState::Stopped);
        }
        Ok(if mc.starting {
            MachineState::Starting
        } else {
            MachineState::Running
        })
    }

    fn use_provider_network_setup(&self) -> bool {
        true
    }

    fn start_networking(&self, _mc: &MachineConfig, _cmd: &mut GvproxyCommand) -> Result<()> {
        Ok(())
    }

    fn update_ssh_port(&self, mc: &mut MachineConfig, port: u16) -> Result<()> {
        let cfg = wsl_config(mc)?;
        let script = format!(
            "mkdir -p /etc/ssh/sshd_config.d && printf 'Port %s\\n' {} > {}",
            port, SSHD_DROP_IN
        );
        run_in_distro(&cfg.distribution, &script)?;
        tracing::info!(machine = %mc.name, port, "sshd port updated");
        Ok(())
    }

    fn set_provider_attributes(&self, mc: &mut MachineConfig, opts: &SetOptions) -> Result<()> {
        if opts.cpus.is_some() || opts.memory.is_some() {
            tracing::warn!(
                machine = %mc.name,
                "WSL applies cpu and memory limits to the whole WSL VM via .wslconfig"
            );
        }
        if let Some(cpus) = opts.cpus {
            mc.resources.cpus = cpus;
        }
        if let Some(memory) = opts.memory {
            mc.resources.memory = memory;
        }
        Ok(())
    }

    fn ready_socket(&self, _mc: &MachineConfig) -> Option<crate::vmfile::VmFile> {
        None
    }

    fn remove_all(&self) -> Result<()> {
        let mut errors = Vec::new();
        for mc in MachineConfig::load_all_in_dir(&self.dirs)?.values() {
            let Ok(cfg) = wsl_config(mc) else { continue };
            let result = is_registered(&cfg.distribution).and_then(|registered| {
                if registered {
                    wsl(&["--unregister", &cfg.distribution]).map(|_| ())
                } else {
                    Ok(())
                }
            });
            if let Err(e) = result {
                errors.push(e);
            }
        }
        Error::from_many(errors)
    }
}
