//! System connection registry.
//!
//! `{config_root}/connections.json` maps machine names to the SSH URI and
//! key clients use to reach the guest API. It is rewritten whenever a
//! machine's SSH port changes.

use crate::error::Result;
use crate::lock::FileLock;
use crate::machine::MachineConfig;
use crate::paths::OvmPaths;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One registered connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Connection {
    /// `ssh://user@127.0.0.1:port/path/to/guest.sock`
    #[serde(rename = "URI")]
    pub uri: String,
    /// Private key path.
    pub identity: String,
}

impl Connection {
    /// Connection for a machine's current SSH settings.
    pub fn for_machine(mc: &MachineConfig) -> Self {
        Self {
            uri: format!(
                "ssh://{}@127.0.0.1:{}{}",
                mc.ssh.remote_username,
                mc.ssh.port,
                mc.guest_api_socket()
            ),
            identity: mc.ssh.identity_path.to_string(),
        }
    }
}

/// The persisted registry.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
    file: PathBuf,
    lock: FileLock,
}

impl ConnectionRegistry {
    /// Registry at the default location.
    pub fn new(paths: &OvmPaths) -> Self {
        Self::at(paths.connections_file())
    }

    /// Registry at `file`, locked through a `.lck` sibling.
    pub fn at(file: impl Into<PathBuf>) -> Self {
        let file = file.into();
        let lock = FileLock::new(file.with_extension("lck"));
        Self { file, lock }
    }

    /// Registry file path.
    pub fn path(&self) -> &Path {
        &self.file
    }

    /// Insert or replace the entry for `mc`.
    pub fn upsert(&self, mc: &MachineConfig) -> Result<()> {
        let _guard = self.lock.acquire()?;
        let mut all = self.read()?;
        let conn = Connection::for_machine(mc);
        tracing::debug!(machine = %mc.name, uri = %conn.uri, "updating connection");
        all.insert(mc.name.clone(), conn);
        crate::util::write_json_atomic(&self.file, &all)
    }

    /// Drop the entry for `name`. Unknown names are fine.
    pub fn remove(&self, name: &str) -> Result<()> {
        let _guard = self.lock.acquire()?;
        let mut all = self.read()?;
        if all.remove(name).is_some() {
            crate::util::write_json_atomic(&self.file, &all)?;
        }
        Ok(())
    }

    /// Every entry.
    pub fn load(&self) -> Result<BTreeMap<String, Connection>> {
        let _guard = self.lock.acquire()?;
        self.read()
    }

    /// Entry for `name`.
    pub fn get(&self, name: &str) -> Result<Option<Connection>> {
        Ok(self.load()?.remove(name))
    }

    fn read(&self) -> Result<BTreeMap<String, Connection>> {
        match std::fs::read(&self.file) {
            Ok(data) if data.is_empty() => Ok(BTreeMap::new()),
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{HypervisorConfig, InitOptions, VmType, WslConfig};
    use crate::vmfile::VmFile;

    fn machine(paths: &OvmPaths, name: &str, port: u16) -> MachineConfig {
        let dirs = paths.machine_dirs(VmType::Wsl);
        let opts = InitOptions {
            name: name.into(),
            cpus: 1,
            memory: 512,
            disk_size: 5,
            remote_username: "core".into(),
            ..Default::default()
        };
        let hv = HypervisorConfig::Wsl(WslConfig {
            distribution: format!("ovm-{}", name),
            install_dir: dirs.data_dir.append(name),
            pid_file: dirs.runtime_dir.append("x.pid"),
        });
        let mut mc = MachineConfig::new(&opts, &dirs, hv, VmFile::new("/keys/id"), Vec::new());
        mc.ssh.port = port;
        mc
    }

    #[test]
    fn test_upsert_replaces_entry() {
        let temp = tempfile::tempdir().unwrap();
        let paths = OvmPaths::with_root(temp.path());
        let registry = ConnectionRegistry::new(&paths);
        assert!(registry.load().unwrap().is_empty());

        registry.upsert(&machine(&paths, "vm1", 40001)).unwrap();
        registry.upsert(&machine(&paths, "vm2", 40002)).unwrap();
        registry.upsert(&machine(&paths, "vm1", 40003)).unwrap();

        let all = registry.load().unwrap();
        assert_eq!(all.len(), 2);
        let vm1 = registry.get("vm1").unwrap().unwrap();
        assert!(vm1.uri.starts_with("ssh://core@127.0.0.1:40003/"), "{}", vm1.uri);
        assert_eq!(vm1.identity, "/keys/id");
    }

    #[test]
    fn test_remove() {
        let temp = tempfile::tempdir().unwrap();
        let paths = OvmPaths::with_root(temp.path());
        let registry = ConnectionRegistry::new(&paths);
        registry.upsert(&machine(&paths, "vm1", 40001)).unwrap();

        registry.remove("vm1").unwrap();
        registry.remove("vm1").unwrap();
        assert_eq!(registry.get("vm1").unwrap(), None);
    }

    #[test]
    fn test_file_shape() {
        let temp = tempfile::tempdir().unwrap();
        let paths = OvmPaths::with_root(temp.path());
        let registry = ConnectionRegistry::new(&paths);
        registry.upsert(&machine(&paths, "vm1", 40001)).unwrap();

        let value: serde_json::Value =
            serde_json::from_slice(&std::fs::read(paths.connections_file()).unwrap()).unwrap();
        assert!(value["vm1"]["URI"].is_string());
        assert_eq!(value["vm1"]["Identity"], "/keys/id");
    }
}
