//! Hypervisor providers.
//!
//! Each backend implements [`VmProvider`]. Exactly one is selected per
//! target by [`get_system_provider`]; there is no runtime registry.

mod applehv;
mod helper;
mod libkrun;
mod wsl;

pub use applehv::AppleHvProvider;
pub use helper::{HelperCommand, HelperKind};
pub(crate) use helper::detach as helper_detach;
pub use libkrun::LibKrunProvider;
pub use wsl::WslProvider;

use crate::config::OvmConfig;
use crate::error::{Error, Result};
use crate::machine::{
    HypervisorConfig, InitOptions, MachineConfig, MachineState, MountType, SetOptions, VmType,
};
use crate::network::GvproxyCommand;
use crate::paths::{MachineDirs, OvmPaths};
use crate::process::ProcessRegistry;
use crate::vmfile::VmFile;
use std::path::Path;
use std::sync::Arc;

/// A hypervisor backend.
pub trait VmProvider: Send + Sync {
    /// Backend kind; also selects the directory set.
    fn vm_type(&self) -> VmType;

    /// Whether a machine of this name is live on the hypervisor.
    fn exists(&self, name: &str) -> Result<bool>;

    /// Upper bound on vCPUs.
    fn max_cpus(&self) -> u32 {
        crate::host::cpu_count()
    }

    /// How host shares reach the guest.
    fn mount_type(&self) -> MountType {
        MountType::VirtioFs
    }

    /// Whether machines get an external data disk.
    fn uses_data_disk(&self) -> bool {
        false
    }

    /// Provider section for a new machine.
    fn hypervisor_config(&self, name: &str, dirs: &MachineDirs) -> HypervisorConfig;

    /// Materialise the root image at `mc.image_path`.
    ///
    /// A user-supplied image always wins over any default.
    fn get_disk(&self, user_input: Option<&Path>, dirs: &MachineDirs, mc: &MachineConfig)
        -> Result<()>;

    /// Prepare launch state without starting anything.
    fn create_vm(&self, opts: &InitOptions, mc: &mut MachineConfig) -> Result<()>;

    /// Launch the hypervisor helper and register it. Returns its pid.
    fn start_vm(&self, mc: &MachineConfig, registry: &ProcessRegistry) -> Result<u32>;

    /// Graceful or forced shutdown. Stopping a stopped machine is a no-op.
    fn stop_vm(&self, mc: &MachineConfig, hard_stop: bool) -> Result<()>;

    /// Observed state.
    fn state(&self, mc: &MachineConfig) -> Result<MachineState>;

    /// True when the backend handles networking itself.
    fn use_provider_network_setup(&self) -> bool {
        false
    }

    /// Add backend-specific arguments to the network proxy command.
    fn start_networking(&self, mc: &MachineConfig, cmd: &mut GvproxyCommand) -> Result<()>;

    /// Record a reassigned SSH port in backend state.
    fn update_ssh_port(&self, mc: &mut MachineConfig, port: u16) -> Result<()>;

    /// Apply changed settings to backend state.
    fn set_provider_attributes(&self, mc: &mut MachineConfig, opts: &SetOptions) -> Result<()>;

    /// Socket the guest connects to once it has booted, if any.
    fn ready_socket(&self, mc: &MachineConfig) -> Option<VmFile> {
        match &mc.hypervisor {
            HypervisorConfig::LibKrun(h) | HypervisorConfig::AppleHv(h) => {
                Some(h.ready_socket.clone())
            }
            HypervisorConfig::Wsl(_) => None,
        }
    }

    /// Backend cleanup during reset, before directories are removed.
    fn remove_all(&self) -> Result<()> {
        Ok(())
    }
}

/// Shared handle to the active provider.
pub type SharedProvider = Arc<dyn VmProvider>;

/// The provider compiled in for this target.
pub fn get_system_provider(config: &OvmConfig, paths: &OvmPaths) -> Result<SharedProvider> {
    system_provider(config, paths)
}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
fn system_provider(config: &OvmConfig, paths: &OvmPaths) -> Result<SharedProvider> {
    let dirs = paths.machine_dirs(VmType::LibKrun);
    Ok(Arc::new(LibKrunProvider::new(&config.krunkit_binary, dirs)))
}

#[cfg(all(target_os = "macos", not(target_arch = "aarch64")))]
fn system_provider(config: &OvmConfig, paths: &OvmPaths) -> Result<SharedProvider> {
    let dirs = paths.machine_dirs(VmType::AppleHv);
    Ok(Arc::new(AppleHvProvider::new(&config.vfkit_binary, dirs)))
}

#[cfg(target_os = "windows")]
fn system_provider(_config: &OvmConfig, paths: &OvmPaths) -> Result<SharedProvider> {
    Ok(Arc::new(WslProvider::new(paths.machine_dirs(VmType::Wsl))))
}

#[cfg(target_os = "linux")]
fn system_provider(config: &OvmConfig, paths: &OvmPaths) -> Result<SharedProvider> {
    let dirs = paths.machine_dirs(VmType::LibKrun);
    Ok(Arc::new(LibKrunProvider::new(&config.krunkit_binary, dirs)))
}

#[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
fn system_provider(_config: &OvmConfig, _paths: &OvmPaths) -> Result<SharedProvider> {
    Err(Error::HypervisorUnavailable(
        "no provider for this platform".into(),
    ))
}

/// Every provider type, for reset.
pub fn all_providers(config: &OvmConfig, paths: &OvmPaths) -> Vec<SharedProvider> {
    VmType::ALL
        .into_iter()
        .map(|t| -> SharedProvider {
            let dirs = paths.machine_dirs(t);
            match t {
                VmType::Wsl => Arc::new(WslProvider::new(dirs)),
                VmType::LibKrun => Arc::new(LibKrunProvider::new(&config.krunkit_binary, dirs)),
                VmType::AppleHv => Arc::new(AppleHvProvider::new(&config.vfkit_binary, dirs)),
            }
        })
        .collect()
}

/// Shared `exists` for helper-backed providers: config present and helper alive.
pub(crate) fn helper_exists(
    provider: &dyn VmProvider,
    name: &str,
    dirs: &MachineDirs,
) -> Result<bool> {
    match MachineConfig::load_by_name(name, dirs) {
        Ok(mc) => Ok(provider.state(&mc)? != MachineState::Stopped),
        Err(Error::NoSuchVm(_)) => Ok(false),
        Err(Error::Incompatible { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}
