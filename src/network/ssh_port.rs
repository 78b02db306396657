//! SSH port assignment.
//!
//! A machine keeps its forwarded SSH port across restarts unless the port
//! is taken by something else when it starts. Reassignment persists an
//! invalid port before releasing the old reservation, so an interrupted
//! reassignment leaves a config that forces a fresh allocation next time
//! instead of one pointing at a port another machine may now own.

use super::ConnectionRegistry;
use crate::error::Result;
use crate::machine::config::INVALID_PORT;
use crate::machine::MachineConfig;
use crate::ports::{is_local_port_available, PortAllocator};
use crate::provider::VmProvider;

/// Make sure `mc` has a usable SSH port, reassigning if needed.
pub fn ensure_ssh_port(
    mc: &mut MachineConfig,
    provider: &dyn VmProvider,
    ports: &PortAllocator,
    connections: &ConnectionRegistry,
) -> Result<u16> {
    let current = mc.ssh.port;
    if current != INVALID_PORT && is_local_port_available(current) {
        // The reservation file may have been lost or reset since the port was assigned.
        ports.reserve(current)?;
        return Ok(current);
    }
    if current != INVALID_PORT {
        tracing::info!(machine = %mc.name, port = current, "ssh port in use, reassigning");
    }
    reassign_ssh_port(mc, provider, ports, connections)
}

/// Give `mc` a freshly allocated SSH port.
pub fn reassign_ssh_port(
    mc: &mut MachineConfig,
    provider: &dyn VmProvider,
    ports: &PortAllocator,
    connections: &ConnectionRegistry,
) -> Result<u16> {
    let old = mc.ssh.port;

    mc.ssh.port = INVALID_PORT;
    mc.write()?;

    if old != INVALID_PORT {
        ports.release(old)?;
    }

    let port = ports.allocate()?;
    if let Err(e) = provider.update_ssh_port(mc, port) {
        if let Err(release_err) = ports.release(port) {
            tracing::warn!(port, error = %release_err, "failed to release port");
        }
        return Err(e);
    }

    mc.ssh.port = port;
    mc.write()?;
    connections.upsert(mc)?;

    tracing::info!(machine = %mc.name, old, port, "ssh port assigned");
    Ok(port)
}
