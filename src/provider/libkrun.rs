//! libkrun provider via krunkit.

use super::helper::{self, HelperCommand, HelperKind};
use super::VmProvider;
use crate::error::Result;
use crate::machine::{
    disk, HelperConfig, HypervisorConfig, InitOptions, MachineConfig, MachineState, SetOptions,
    VmType,
};
use crate::network::GvproxyCommand;
use crate::paths::MachineDirs;
use crate::process::ProcessRegistry;
use std::path::{Path, PathBuf};

/// libkrun does not scale past this many vCPUs.
pub const MAX_CPUS: u32 = 8;

/// krunkit-backed machines.
#[derive(Debug, Clone)]
pub struct LibKrunProvider {
    binary: PathBuf,
    dirs: MachineDirs,
}

impl LibKrunProvider {
    /// Provider using `binary` and the libkrun directory set.
    pub fn new(binary: &Path, dirs: MachineDirs) -> Self {
        Self {
            binary: binary.to_path_buf(),
            dirs,
        }
    }
}

/// Helper section shared by krunkit and vfkit machines.
pub(crate) fn helper_section(name: &str, dirs: &MachineDirs, efi: bool) -> HelperConfig {
    let runtime = |suffix: &str| dirs.runtime_dir.append(format!("{}-{}", name, suffix));
    HelperConfig {
        pid_file: runtime("helper.pid"),
        log_file: dirs.data_dir.append(format!("{}.log", name)),
        ready_socket: runtime("ready.sock"),
        network_socket: runtime("gvproxy.sock"),
        efi_variable_store: efi.then(|| dirs.data_dir.append(format!("{}-efi-store", name))),
    }
}

/// Copy or decompress the user image into place.
pub(crate) fn place_image(user_input: Option<&Path>, mc: &MachineConfig) -> Result<()> {
    match user_input {
        Some(src) => disk::decompress(src, mc.image_path.path()),
        None if mc.image_path.exists() => {
            tracing::debug!(machine = %mc.name, "reusing existing root image");
            Ok(())
        }
        None => Err(crate::error::Error::storage(
            "get disk",
            format!("no boot image given for machine '{}'", mc.name),
        )),
    }
}

impl VmProvider for LibKrunProvider {
    fn vm_type(&self) -> VmType {
        VmType::LibKrun
    }

    fn exists(&self, name: &str) -> Result<bool> {
        super::helper_exists(self, name, &self.dirs)
    }

    fn max_cpus(&self) -> u32 {
        MAX_CPUS.min(crate::host::cpu_count())
    }

    fn uses_data_disk(&self) -> bool {
        true
    }

    fn hypervisor_config(&self, name: &str, dirs: &MachineDirs) -> HypervisorConfig {
        HypervisorConfig::LibKrun(helper_section(name, dirs, false))
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
        HelperCommand::for_machine(HelperKind::Krunkit, &self.binary, mc)?;
        Ok(())
    }

    fn start_vm(&self, mc: &MachineConfig, registry: &ProcessRegistry) -> Result<u32> {
        let cmd = HelperCommand::for_machine(HelperKind::Krunkit, &self.binary, mc)?;
        helper::launch(&cmd, mc, registry)
    }

    fn stop_vm(&self, mc: &MachineConfig, hard_stop: bool) -> Result<()> {
        helper::stop(mc, hard_stop)
    }

    fn state(&self, mc: &MachineConfig) -> Result<MachineState> {
        helper::state(mc)
    }

    fn start_networking(&self, mc: &MachineConfig, cmd: &mut GvproxyCommand) -> Result<()> {
        let helper = helper::helper_config(mc)?;
        helper.network_socket.delete_if_exists()?;
        cmd.listen_vfkit(helper.network_socket.path());
        Ok(())
    }

    fn update_ssh_port(&self, mc: &mut MachineConfig, port: u16) -> Result<()> {
        tracing::debug!(machine = %mc.name, port, "ssh port is passed to the network proxy at start");
        Ok(())
    }

    fn set_provider_attributes(&self, mc: &mut MachineConfig, opts: &SetOptions) -> Result<()> {
        if let Some(cpus) = opts.cpus {
            mc.resources.cpus = cpus;
        }
        if let Some(memory) = opts.memory {
            mc.resources.memory = memory;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::OvmPaths;

    #[test]
    fn test_cpu_ceiling() {
        let temp = tempfile::tempdir().unwrap();
        let provider = LibKrunProvider::new(
            Path::new("krunkit"),
            OvmPaths::with_root(temp.path()).machine_dirs(VmType::LibKrun),
        );
        assert!(provider.max_cpus() <= MAX_CPUS);
        assert!(provider.max_cpus() >= 1);
    }

    #[test]
    fn test_helper_section_paths() {
        let temp = tempfile::tempdir().unwrap();
        let dirs = OvmPaths::with_root(temp.path()).machine_dirs(VmType::LibKrun);
        let section = helper_section("vm1", &dirs, false);
        assert!(section.pid_file.path().starts_with(dirs.runtime_dir.path()));
        assert!(section.efi_variable_store.is_none());
        assert!(helper_section("vm1", &dirs, true).efi_variable_store.is_some());
    }
}
