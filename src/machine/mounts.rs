//! Host-to-guest filesystem shares.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// Maximum virtio-fs tag length in bytes.
pub const MAX_TAG_LEN: usize = 36;

/// How a share reaches the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountType {
    /// virtio-fs device (libkrun, AppleHV).
    VirtioFs,
    /// WSL drvfs automount.
    Wsl,
}

/// One host directory shared into the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Mount {
    /// Host directory (canonical).
    pub source: String,
    /// Guest mount point.
    pub target: String,
    /// Device tag.
    pub tag: String,
    /// Share mechanism.
    #[serde(rename = "Type")]
    pub mount_type: MountType,
    /// Mounted read-only in the guest.
    pub read_only: bool,
}

/// Device tag for a guest target path.
///
/// The target itself when it fits, otherwise a hash prefix of it.
pub fn tag_for_target(target: &str) -> String {
    if target.len() <= MAX_TAG_LEN {
        return target.to_string();
    }
    let digest = format!("{:x}", Sha256::digest(target.as_bytes()));
    digest[..MAX_TAG_LEN].to_string()
}

/// Parse `SRC:DST[:ro|:rw]` volume specs.
///
/// The source must be an existing directory and is canonicalised.
pub fn parse_volumes(specs: &[String], mount_type: MountType) -> Result<Vec<Mount>> {
    let mut mounts = Vec::with_capacity(specs.len());

    for spec in specs {
        let parts = split_volume_spec(spec);
        if parts.len() < 2 || parts.len() > 3 || parts[0].is_empty() || parts[1].is_empty() {
            return Err(Error::Mount(format!(
                "invalid volume specification '{}': expected SRC:DST[:ro]",
                spec
            )));
        }

        let read_only = match parts.get(2) {
            None | Some(&"rw") => false,
            Some(&"ro") => true,
            Some(other) => {
                return Err(Error::Mount(format!(
                    "invalid volume option '{}' in '{}'",
                    other, spec
                )))
            }
        };

        let host_path = PathBuf::from(parts[0]);
        if !host_path.is_dir() {
            return Err(Error::Mount(format!(
                "host path must be an existing directory: {}",
                host_path.display()
            )));
        }
        let host_path = host_path.canonicalize().map_err(|e| {
            Error::Mount(format!("failed to resolve host path '{}': {}", parts[0], e))
        })?;

        let target = parts[1].to_string();
        if !target.starts_with('/') {
            return Err(Error::Mount(format!(
                "guest path must be absolute: {}",
                target
            )));
        }

        if mounts.iter().any(|m: &Mount| m.target == target) {
            return Err(Error::Mount(format!("duplicate guest path: {}", target)));
        }

        mounts.push(Mount {
            source: host_path.to_string_lossy().to_string(),
            tag: tag_for_target(&target),
            target,
            mount_type,
            read_only,
        });
    }

    Ok(mounts)
}

/// Split on `:`, keeping a leading Windows drive (`C:\`) with the source.
fn split_volume_spec(spec: &str) -> Vec<&str> {
    let bytes = spec.as_bytes();
    let has_drive = bytes.len() > 2
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && matches!(bytes[2], b'\\' | b'/');
    if !has_drive {
        return spec.split(':').collect();
    }
    let mut parts: Vec<&str> = spec[2..].split(':').collect();
    let first_len = 2 + parts[0].len();
    parts[0] = &spec[..first_len];
    parts
}
