//! Persisted machine configuration.
//!
//! One JSON file per machine at `{config_dir}/{name}.json`, written
//! atomically on every state change. Concurrent invocations against the
//! same machine serialize on `{config_dir}/{name}.lck`.

use crate::error::{Error, Result};
use crate::lock::{FileLock, LockGuard};
use crate::machine::{validate_name, InitOptions, Mount, VmType, CONFIG_VERSION};
use crate::paths::MachineDirs;
use crate::vmfile::VmFile;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// SSH port value meaning "must be reassigned before use".
pub const INVALID_PORT: u16 = 0;

/// Resources given to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceConfig {
    /// vCPU count.
    #[serde(rename = "CPUs")]
    pub cpus: u32,
    /// Memory in MiB.
    pub memory: u64,
    /// Data disk size in GiB.
    pub disk_size: u64,
}

/// How to reach the guest over SSH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SshConfig {
    /// Private key.
    pub identity_path: VmFile,
    /// Host-side forwarded port; [`INVALID_PORT`] means "reassign".
    pub port: u16,
    /// Guest user.
    pub remote_username: String,
}

/// Versions of the disks currently materialised.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageConfig {
    /// Version label of the root image.
    pub boot_version: String,
    /// Version label of the data disk.
    pub data_version: String,
    /// External data disk, if the provider uses one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_disk_path: Option<VmFile>,
}

/// Host identity the guest API runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostUser {
    /// Guest API runs as root.
    pub rootful: bool,
    /// Host uid, mirrored in the guest.
    #[serde(rename = "UID")]
    pub uid: u32,
}

impl HostUser {
    /// Current host user.
    pub fn current(rootful: bool) -> Self {
        Self {
            rootful,
            uid: current_uid(),
        }
    }
}

#[cfg(unix)]
fn current_uid() -> u32 {
    unsafe { libc::getuid() }
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    1000
}

/// Launch state for krunkit/vfkit helpers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HelperConfig {
    /// Pid file written when the helper is launched.
    pub pid_file: VmFile,
    /// Helper stdout/stderr and guest console.
    pub log_file: VmFile,
    /// Unix socket the guest connects to once booted.
    pub ready_socket: VmFile,
    /// Datagram socket shared with the network proxy.
    pub network_socket: VmFile,
    /// EFI variable store (vfkit only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efi_variable_store: Option<VmFile>,
}

/// WSL distribution state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WslConfig {
    /// Registered distribution name.
    pub distribution: String,
    /// Where the distribution's virtual disk lives.
    pub install_dir: VmFile,
    /// Pid file of the `wsl.exe` session keeping the distribution up.
    pub pid_file: VmFile,
}

/// Exactly one provider-specific section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HypervisorConfig {
    /// WSL.
    Wsl(WslConfig),
    /// krunkit.
    LibKrun(HelperConfig),
    /// vfkit.
    AppleHv(HelperConfig),
}

impl HypervisorConfig {
    /// Provider this section belongs to.
    pub fn vm_type(&self) -> VmType {
        match self {
            HypervisorConfig::Wsl(_) => VmType::Wsl,
            HypervisorConfig::LibKrun(_) => VmType::LibKrun,
            HypervisorConfig::AppleHv(_) => VmType::AppleHv,
        }
    }

    /// Pid file of the hypervisor helper.
    pub fn pid_file(&self) -> &VmFile {
        match self {
            HypervisorConfig::Wsl(c) => &c.pid_file,
            HypervisorConfig::LibKrun(c) | HypervisorConfig::AppleHv(c) => &c.pid_file,
        }
    }
}

/// A named machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MachineConfig {
    /// Machine name; also the config file stem.
    pub name: String,
    /// Schema version; 0 marks a pre-versioning file.
    #[serde(default)]
    pub version: u32,
    /// Provider that owns this machine.
    pub vm_type: VmType,
    /// This config's own path.
    pub config_path: VmFile,
    /// Provider directories.
    pub dirs: MachineDirs,
    /// Root disk image.
    pub image_path: VmFile,
    /// Disk versions.
    #[serde(default)]
    pub image: ImageConfig,
    /// Guest resources.
    pub resources: ResourceConfig,
    /// SSH access.
    #[serde(rename = "SSH")]
    pub ssh: SshConfig,
    /// Host user mirrored in the guest.
    #[serde(default)]
    pub host_user: HostUser,
    /// Host shares, in order.
    #[serde(default)]
    pub mounts: Vec<Mount>,
    /// Provider-specific state.
    pub hypervisor: HypervisorConfig,
    /// Set while a start is in progress.
    #[serde(default)]
    pub starting: bool,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Last time the guest became ready.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_up: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct VersionProbe {
    #[serde(rename = "Version", default)]
    version: u32,
}

impl MachineConfig {
    /// Construct a new config. Pure; nothing is written.
    pub fn new(
        opts: &InitOptions,
        dirs: &MachineDirs,
        hypervisor: HypervisorConfig,
        identity_path: VmFile,
        mounts: Vec<Mount>,
    ) -> Self {
        let vm_type = hypervisor.vm_type();
        Self {
            name: opts.name.clone(),
            version: CONFIG_VERSION,
            vm_type,
            config_path: config_file(dirs, &opts.name),
            dirs: dirs.clone(),
            image_path: dirs.data_dir.append(vm_type.image_file_name(&opts.name)),
            image: ImageConfig::default(),
            resources: ResourceConfig {
                cpus: opts.cpus,
                memory: opts.memory,
                disk_size: opts.disk_size,
            },
            ssh: SshConfig {
                identity_path,
                port: INVALID_PORT,
                remote_username: opts.remote_username.clone(),
            },
            host_user: HostUser::current(opts.rootful),
            mounts,
            hypervisor,
            starting: false,
            created: Utc::now(),
            last_up: None,
        }
    }

    /// Persist atomically.
    pub fn write(&self) -> Result<()> {
        if self.config_path.path().as_os_str().is_empty() {
            return Err(Error::config(
                "write machine config",
                format!("no config path set for machine '{}'", self.name),
            ));
        }
        crate::util::write_json_atomic(self.config_path.path(), self)?;
        tracing::trace!(machine = %self.name, path = %self.config_path, "machine config written");
        Ok(())
    }

    /// Load `{config_dir}/{name}.json`.
    pub fn load_by_name(name: &str, dirs: &MachineDirs) -> Result<Self> {
        validate_name(name)?;
        let path = config_file(dirs, name);
        let data = match path.read() {
            Ok(d) => d,
            Err(e) if e.is_not_found() => return Err(Error::NoSuchVm(name.to_string())),
            Err(e) => return Err(e),
        };
        let mc = Self::parse(path.path(), &data)?;
        if mc.name != name {
            return Err(Error::Incompatible {
                path: path.path().to_path_buf(),
                reason: format!("file holds machine '{}'", mc.name),
            });
        }
        Ok(mc)
    }

    /// Load every machine in `dirs.config_dir`.
    ///
    /// Unreadable or incompatible files are logged and skipped.
    pub fn load_all_in_dir(dirs: &MachineDirs) -> Result<BTreeMap<String, Self>> {
        let mut machines = BTreeMap::new();
        let entries = match std::fs::read_dir(dirs.config_dir.path()) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(machines),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match Self::load_by_name(stem, dirs) {
                Ok(mc) => {
                    machines.insert(mc.name.clone(), mc);
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "skipping machine config");
                }
            }
        }

        Ok(machines)
    }

    fn parse(path: &Path, data: &[u8]) -> Result<Self> {
        let probe: VersionProbe = serde_json::from_slice(data).map_err(|e| Error::Incompatible {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if probe.version == 0 {
            return Err(Error::Incompatible {
                path: path.to_path_buf(),
                reason: "config predates versioning, re-create the machine".into(),
            });
        }
        if probe.version > CONFIG_VERSION {
            return Err(Error::Incompatible {
                path: path.to_path_buf(),
                reason: format!(
                    "config version {} is newer than supported version {}",
                    probe.version, CONFIG_VERSION
                ),
            });
        }
        serde_json::from_slice(data).map_err(|e| Error::Incompatible {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Take the per-machine advisory lock.
    pub fn lock(&self) -> Result<LockGuard> {
        machine_lock(&self.dirs, &self.name).acquire()
    }

    /// Delete the config file and its lock. Missing files are fine.
    pub fn remove(&self) -> Result<()> {
        self.config_path.delete_if_exists()?;
        VmFile::new(machine_lock(&self.dirs, &self.name).path()).delete_if_exists()
    }

    /// `{runtime_dir}/{name}-{suffix}`.
    pub fn runtime_file(&self, suffix: &str) -> VmFile {
        self.dirs
            .runtime_dir
            .append(format!("{}-{}", self.name, suffix))
    }

    /// Host side of the forwarded guest API socket.
    pub fn api_socket(&self) -> VmFile {
        self.runtime_file("api.sock")
    }

    /// Guest side of the forwarded API socket.
    pub fn guest_api_socket(&self) -> String {
        guest_socket_path(self.host_user)
    }
}

/// Guest API socket for a host user.
pub fn guest_socket_path(user: HostUser) -> String {
    if user.rootful {
        "/run/podman/podman.sock".to_string()
    } else {
        format!("/run/user/{}/ovm/ovm_guest.sock", user.uid)
    }
}

/// `{config_dir}/{name}.json`.
pub fn config_file(dirs: &MachineDirs, name: &str) -> VmFile {
    dirs.config_dir.append(format!("{}.json", name))
}

/// Lock for a machine name, usable before its config exists.
pub fn machine_lock(dirs: &MachineDirs, name: &str) -> FileLock {
    FileLock::new(dirs.config_dir.append(format!("{}.lck", name)).path())
}
