//! Machines: definitions, persisted config and lifecycle orchestration.

pub mod config;
pub mod disk;
pub mod mounts;
pub mod shim;

pub use config::{
    HelperConfig, HostUser, HypervisorConfig, ImageConfig, MachineConfig, ResourceConfig,
    SshConfig, WslConfig,
};
pub use mounts::{Mount, MountType};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Maximum machine name length.
pub const MAX_NAME_LEN: usize = 30;

/// Name used when none is given.
pub const DEFAULT_MACHINE_NAME: &str = "default";

/// Current machine config schema version.
pub const CONFIG_VERSION: u32 = 1;

/// Hypervisor backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmType {
    /// Windows Subsystem for Linux 2.
    Wsl,
    /// libkrun via krunkit.
    LibKrun,
    /// Apple Virtualization.framework via vfkit.
    #[serde(rename = "applehv")]
    AppleHv,
}

impl VmType {
    /// Every provider type this build knows about.
    pub const ALL: [VmType; 3] = [VmType::Wsl, VmType::LibKrun, VmType::AppleHv];

    /// Stable lowercase identifier, also used as directory name.
    pub fn as_str(&self) -> &'static str {
        match self {
            VmType::Wsl => "wsl",
            VmType::LibKrun => "libkrun",
            VmType::AppleHv => "applehv",
        }
    }

    /// Extension of the root disk image; WSL images have none.
    pub fn image_extension(&self) -> Option<&'static str> {
        match self {
            VmType::Wsl => None,
            VmType::LibKrun | VmType::AppleHv => Some("raw"),
        }
    }

    /// File name of the root disk image for `machine`.
    pub fn image_file_name(&self, machine: &str) -> String {
        let base = format!("{}-{}", machine, std::env::consts::ARCH);
        match self.image_extension() {
            Some(ext) => format!("{}.{}", base, ext),
            None => base,
        }
    }
}

impl fmt::Display for VmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    /// Not running.
    Stopped,
    /// Helper launched, guest not yet ready.
    Starting,
    /// Guest is up.
    Running,
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineState::Stopped => write!(f, "stopped"),
            MachineState::Starting => write!(f, "starting"),
            MachineState::Running => write!(f, "running"),
        }
    }
}

/// Validate a machine name.
///
/// Rules:
/// - Length: 1..=30 characters
/// - First character: ASCII letter or digit
/// - Remaining characters: ASCII letters, digits, `_`, `.`, `-`
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason: String| Error::InvalidName {
        name: name.to_string(),
        reason,
    };

    let first = name
        .chars()
        .next()
        .ok_or_else(|| invalid("name cannot be empty".into()))?;

    if name.len() > MAX_NAME_LEN {
        return Err(invalid(format!(
            "too long: {} characters (max {})",
            name.len(),
            MAX_NAME_LEN
        )));
    }

    if !first.is_ascii_alphanumeric() {
        return Err(invalid("must start with a letter or digit".into()));
    }

    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
    {
        return Err(invalid(format!("contains invalid character '{}'", c)));
    }

    Ok(())
}

/// Parameters for `init`.
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Machine name.
    pub name: String,
    /// Supervising parent pid; defaults to our parent.
    pub ppid: Option<u32>,
    /// Root filesystem image supplied by the user.
    pub boot_image: Option<PathBuf>,
    /// Version label of the boot image; unchanged versions skip re-fetching.
    pub boot_version: String,
    /// Version label of the data disk; a change recreates it.
    pub data_version: String,
    /// vCPU count.
    pub cpus: u32,
    /// Memory in MiB.
    pub memory: u64,
    /// Data disk size in GiB.
    pub disk_size: u64,
    /// `SRC:DST[:ro]` volume specs.
    pub volumes: Vec<String>,
    /// Existing SSH private key to use instead of generating one.
    pub identity_path: Option<PathBuf>,
    /// Guest user for SSH.
    pub remote_username: String,
    /// Run the guest API as root.
    pub rootful: bool,
}

/// Parameters for `start`.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Supervising parent pid; defaults to our parent.
    pub ppid: Option<u32>,
    /// Where to POST progress events.
    pub report_url: Option<String>,
    /// Control-plane listen address.
    pub api_listen: Option<std::net::SocketAddr>,
    /// Launch the SSH command proxy.
    pub command_proxy: bool,
}

/// Parameters for `set`. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// New vCPU count.
    pub cpus: Option<u32>,
    /// New memory in MiB.
    pub memory: Option<u64>,
    /// Replacement volume list.
    pub volumes: Option<Vec<String>>,
}
