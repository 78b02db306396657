//! Apple Virtualization.framework provider via vfkit.

use super::helper::{self, HelperCommand, HelperKind};
use super::libkrun::{helper_section, place_image};
use super::VmProvider;
use crate::error::Result;
use crate::machine::{
    HypervisorConfig, InitOptions, MachineConfig, MachineState, SetOptions, VmType,
};
use crate::network::GvproxyCommand;
use crate::paths::MachineDirs;
use crate::process::ProcessRegistry;
use std::path::{Path, PathBuf};

/// vfkit-backed machines.
#[derive(Debug, Clone)]
pub struct AppleHvProvider {
    binary: PathBuf,
    dirs: MachineDirs,
}

impl AppleHvProvider {
    /// Provider using `binary` and the applehv directory set.
    pub fn new(binary: &Path, dirs: MachineDirs) -> Self {
        Self {
            binary: binary.to_path_buf(),
            dirs,
        }
    }
}

impl VmProvider for AppleHvProvider {
    fn vm_type(&self) -> VmType {
        VmType::AppleHv
    }

    fn exists(&self, name: &str) -> Result<bool> {
        super::helper_exists(self, name, &self.dirs)
    }

    fn uses_data_disk(&self) -> bool {
        true
    }

    fn hypervisor_config(&self, name: &str, dirs: &MachineDirs) -> HypervisorConfig {
        HypervisorConfig::AppleHv(helper_section(name, dirs, true))
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
        // vfkit creates the variable store on first boot; a stale one from
        // a previous init would carry old boot entries.
        if let HypervisorConfig::AppleHv(h) = &mc.hypervisor {
            if let Some(store) = &h.efi_variable_store {
                store.delete_if_exists()?;
            }
        }
        HelperCommand::for_machine(HelperKind::Vfkit, &self.binary, mc)?;
        Ok(())
    }

    fn start_vm(&self, mc: &MachineConfig, registry: &ProcessRegistry) -> Result<u32> {
        let cmd = HelperCommand::for_machine(HelperKind::Vfkit, &self.binary, mc)?;
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
    use crate::vmfile::VmFile;

    #[test]
    fn test_create_vm_discards_old_efi_store() {
        let temp = tempfile::tempdir().unwrap();
        let dirs = OvmPaths::with_root(temp.path()).machine_dirs(VmType::AppleHv);
        dirs.create_all().unwrap();
        let provider = AppleHvProvider::new(Path::new("vfkit"), dirs.clone());

        let opts = InitOptions {
            name: "vm1".into(),
            cpus: 2,
            memory: 1024,
            disk_size: 10,
            ..Default::default()
        };
        let mut mc = MachineConfig::new(
            &opts,
            &dirs,
            provider.hypervisor_config("vm1", &dirs),
            VmFile::new("/id"),
            Vec::new(),
        );
        let store = match &mc.hypervisor {
            HypervisorConfig::AppleHv(h) => h.efi_variable_store.clone().unwrap(),
            _ => unreachable!(),
        };
        std::fs::write(store.path(), b"old").unwrap();

        provider.create_vm(&opts, &mut mc).unwrap();
        assert!(!store.exists());
    }
}
