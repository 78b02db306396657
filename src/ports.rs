//! Local TCP port reservations.
//!
//! Ports handed to machines (SSH forwarding) are recorded in a JSON array
//! so two machines never get the same port, even when the first one is
//! stopped and the OS would consider its port free. The file is shared by
//! every `ovm` process and guarded by a sibling lock file.

use crate::error::{Error, Result};
use crate::lock::FileLock;
use crate::paths::OvmPaths;
use crate::retry::{retry, RetryPolicy};
use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::path::{Path, PathBuf};

/// Attempts to find a port the OS considers free and we have not reserved.
const MAX_PORT_SEARCH: u32 = 10_000;

/// Persisted set of reserved ports.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    file: PathBuf,
    lock: FileLock,
}

impl PortAllocator {
    /// Allocator backed by the global reservation file.
    pub fn new(paths: &OvmPaths) -> Self {
        Self::at(paths.port_alloc_file(), paths.port_alloc_lock())
    }

    /// Allocator backed by explicit paths.
    pub fn at(file: impl Into<PathBuf>, lock: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            lock: FileLock::new(lock),
        }
    }

    /// Reserve a free ephemeral port.
    pub fn allocate(&self) -> Result<u16> {
        let _guard = self.lock.acquire()?;
        let mut reserved = load_reservations(&self.file);

        let port = retry(RetryPolicy::immediate(MAX_PORT_SEARCH), |_| {
            let port = probe_ephemeral_port()?;
            if reserved.contains(&port) {
                return Err(Error::network(
                    "allocate port",
                    format!("port {} already reserved", port),
                ));
            }
            Ok(port)
        })
        .map_err(|e| {
            Error::network(
                "allocate port",
                format!(
                    "no unreserved port after {} attempts: {}",
                    e.attempts, e.last_error
                ),
            )
        })?;

        reserved.insert(port);
        store_reservations(&self.file, &reserved)?;
        tracing::debug!(port, "reserved port");
        Ok(port)
    }

    /// Record `port` as reserved. Reserving a port already in the set is a no-op.
    pub fn reserve(&self, port: u16) -> Result<()> {
        let _guard = self.lock.acquire()?;
        let mut reserved = load_reservations(&self.file);
        if reserved.insert(port) {
            store_reservations(&self.file, &reserved)?;
            tracing::debug!(port, "re-recorded port reservation");
        }
        Ok(())
    }

    /// Drop a reservation. Releasing an unknown port is not an error.
    pub fn release(&self, port: u16) -> Result<()> {
        let _guard = self.lock.acquire()?;
        let mut reserved = load_reservations(&self.file);
        if reserved.remove(&port) {
            store_reservations(&self.file, &reserved)?;
            tracing::debug!(port, "released port");
        }
        Ok(())
    }

    /// Snapshot of the reserved set.
    pub fn reserved(&self) -> Result<BTreeSet<u16>> {
        let _guard = self.lock.acquire()?;
        Ok(load_reservations(&self.file))
    }

    /// Whether `port` is recorded as reserved.
    pub fn is_reserved(&self, port: u16) -> Result<bool> {
        Ok(self.reserved()?.contains(&port))
    }
}

/// Best-effort probe: can we bind `127.0.0.1:port` right now?
///
/// Port 0 is never available.
pub fn is_local_port_available(port: u16) -> bool {
    if port == 0 {
        return false;
    }
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// Let the OS pick a free port on the loopback interface.
fn probe_ephemeral_port() -> Result<u16> {
    let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
        .map_err(|e| Error::network("probe port", e.to_string()))?;
    let port = listener
        .local_addr()
        .map_err(|e| Error::network("probe port", e.to_string()))?
        .port();
    Ok(port)
}

/// Missing or corrupt files are treated as an empty set.
fn load_reservations(path: &Path) -> BTreeSet<u16> {
    let data = match std::fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeSet::new(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "could not read port reservations, starting fresh");
            return BTreeSet::new();
        }
    };
    match serde_json::from_slice::<Vec<u16>>(&data) {
        Ok(ports) => ports.into_iter().collect(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "corrupt port reservations, starting fresh");
            BTreeSet::new()
        }
    }
}

fn store_reservations(path: &Path, ports: &BTreeSet<u16>) -> Result<()> {
    let list: Vec<u16> = ports.iter().copied().collect();
    crate::util::write_json_atomic(path, &list)
}
