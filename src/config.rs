//! Global ovm configuration.
//!
//! Defaults for new machines and the locations of helper binaries, stored
//! as TOML at `{config_root}/ovm.toml`.

use crate::error::{Error, Result};
use crate::paths::OvmPaths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration file name.
const CONFIG_FILE: &str = "ovm.toml";

/// Global ovm configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OvmConfig {
    /// Configuration format version.
    pub version: u8,

    /// Default number of vCPUs for new machines.
    pub default_cpus: u32,

    /// Default memory in MiB for new machines.
    pub default_memory: u64,

    /// Default data disk size in GiB for new machines.
    pub default_disk_size: u64,

    /// User-mode network proxy binary.
    pub gvproxy_binary: PathBuf,

    /// libkrun helper binary.
    pub krunkit_binary: PathBuf,

    /// Virtualization.framework helper binary.
    pub vfkit_binary: PathBuf,

    /// Guest user for SSH.
    pub remote_username: String,

    /// Port the command proxy listens on.
    pub cmd_proxy_port: u16,

    /// How long to wait for the guest API to answer `_ping`.
    #[serde(with = "humantime_serde_compat")]
    pub api_ping_timeout: Duration,

    /// How long to wait for the guest to signal readiness.
    #[serde(with = "humantime_serde_compat")]
    pub ready_timeout: Duration,
}

impl Default for OvmConfig {
    fn default() -> Self {
        Self {
            version: 1,
            default_cpus: 2,
            default_memory: 2048,
            default_disk_size: 100,
            gvproxy_binary: PathBuf::from("gvproxy"),
            krunkit_binary: PathBuf::from("krunkit"),
            vfkit_binary: PathBuf::from("vfkit"),
            remote_username: "root".to_string(),
            cmd_proxy_port: ovm_protocol::ports::CMD_PROXY,
            api_ping_timeout: Duration::from_secs(5),
            ready_timeout: Duration::from_secs(90),
        }
    }
}

impl OvmConfig {
    /// Load configuration from the default location.
    ///
    /// If the file doesn't exist, returns the default configuration.
    pub fn load(paths: &OvmPaths) -> Result<Self> {
        Self::load_from(&paths.config_root().join(CONFIG_FILE))
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(Error::config("read config", e.to_string())),
        };
        toml::from_str(&text)
            .map_err(|e| Error::config(format!("parse {}", path.display()), e.to_string()))
    }

    /// Save configuration to the default location.
    pub fn save(&self, paths: &OvmPaths) -> Result<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| Error::config("serialize config", e.to_string()))?;
        crate::util::write_atomic(&paths.config_root().join(CONFIG_FILE), text.as_bytes())
    }
}

/// Durations are stored as human-readable strings ("5s", "1m 30s").
mod humantime_serde_compat {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(d)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
