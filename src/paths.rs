//! Filesystem layout.
//!
//! ```text
//! {config_root}/ovm.toml
//! {config_root}/connections.json
//! {config_root}/machine/{vmtype}/{name}.json
//! {data_root}/machine/port-alloc.dat   (+ port-alloc.lck)
//! {data_root}/machine/{vmtype}/        images, data disks, keys
//! {data_root}/machine/{vmtype}/cache/
//! {runtime_root}/{vmtype}/             pid files, sockets, logs
//! ```

use crate::error::{Error, Result};
use crate::machine::VmType;
use crate::vmfile::VmFile;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable relocating every ovm root under one directory.
pub const OVM_HOME_ENV: &str = "OVM_HOME";

const APP_DIR: &str = "ovm";

/// Root directories for config, data and runtime state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OvmPaths {
    config_root: PathBuf,
    data_root: PathBuf,
    runtime_root: PathBuf,
}

impl OvmPaths {
    /// Resolve roots from `OVM_HOME` or the platform directories.
    pub fn from_env() -> Result<Self> {
        if let Some(home) = std::env::var_os(OVM_HOME_ENV).filter(|v| !v.is_empty()) {
            return Ok(Self::with_root(PathBuf::from(home)));
        }

        let config_root = dirs::config_dir()
            .ok_or_else(|| Error::config("resolve path", "could not determine config directory"))?
            .join(APP_DIR);
        let data_root = dirs::data_local_dir()
            .or_else(dirs::data_dir)
            .ok_or_else(|| Error::config("resolve path", "could not determine data directory"))?
            .join(APP_DIR);
        let runtime_root = dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_DIR);

        Ok(Self {
            config_root,
            data_root,
            runtime_root,
        })
    }

    /// Place all roots under `root`.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            config_root: root.join("config"),
            data_root: root.join("data"),
            runtime_root: root.join("run"),
        }
    }

    /// Global config directory.
    pub fn config_root(&self) -> &Path {
        &self.config_root
    }

    /// Global data directory.
    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    /// Global runtime directory.
    pub fn runtime_root(&self) -> &Path {
        &self.runtime_root
    }

    /// Persisted port reservations.
    pub fn port_alloc_file(&self) -> PathBuf {
        self.data_root.join("machine").join("port-alloc.dat")
    }

    /// Lock guarding [`Self::port_alloc_file`].
    pub fn port_alloc_lock(&self) -> PathBuf {
        self.data_root.join("machine").join("port-alloc.lck")
    }

    /// SSH connection registry.
    pub fn connections_file(&self) -> PathBuf {
        self.config_root.join("connections.json")
    }

    /// Directory set for one provider type.
    pub fn machine_dirs(&self, vm_type: VmType) -> MachineDirs {
        let kind = vm_type.as_str();
        let data_dir = self.data_root.join("machine").join(kind);
        MachineDirs {
            config_dir: VmFile::new(self.config_root.join("machine").join(kind)),
            image_cache_dir: VmFile::new(data_dir.join("cache")),
            data_dir: VmFile::new(data_dir),
            runtime_dir: VmFile::new(self.runtime_root.join(kind)),
        }
    }
}

/// Per-provider directories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MachineDirs {
    /// Machine config files.
    pub config_dir: VmFile,
    /// Disk images, data disks and keys.
    pub data_dir: VmFile,
    /// Cached downloaded/decompressed images.
    pub image_cache_dir: VmFile,
    /// Sockets, pid files, logs.
    pub runtime_dir: VmFile,
}

impl MachineDirs {
    /// Create every directory. Idempotent.
    pub fn create_all(&self) -> Result<()> {
        for dir in [
            &self.config_dir,
            &self.data_dir,
            &self.image_cache_dir,
            &self.runtime_dir,
        ] {
            dir.create_path()?;
        }
        Ok(())
    }
}
