//! Host capacity queries and resource validation.

use crate::error::{Error, Result};
use sysinfo::System;

/// Total physical memory in MiB.
pub fn total_memory_mib() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.total_memory() / (1024 * 1024)
}

/// Logical CPUs available to us.
pub fn cpu_count() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

/// Reject memory above host capacity.
pub fn check_memory(requested_mib: u64) -> Result<()> {
    check_memory_against(requested_mib, total_memory_mib())
}

pub(crate) fn check_memory_against(requested_mib: u64, total_mib: u64) -> Result<()> {
    if requested_mib == 0 {
        return Err(Error::config("validate memory", "memory must be greater than 0"));
    }
    if requested_mib > total_mib {
        return Err(Error::ResourceExceeded {
            resource: "memory (MiB)",
            requested: requested_mib,
            limit: total_mib,
        });
    }
    Ok(())
}

/// Reject zero or more CPUs than `limit`.
pub fn check_cpus(requested: u32, limit: u32) -> Result<()> {
    if requested == 0 {
        return Err(Error::config("validate cpus", "cpu count must be greater than 0"));
    }
    if requested > limit {
        return Err(Error::ResourceExceeded {
            resource: "cpus",
            requested: requested.into(),
            limit: limit.into(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_reports_memory() {
        assert!(total_memory_mib() > 0);
        assert!(cpu_count() >= 1);
    }

    #[test]
    fn test_memory_bound() {
        check_memory_against(1024, 2048).unwrap();
        check_memory_against(2048, 2048).unwrap();
        assert!(matches!(
            check_memory_against(4096, 2048),
            Err(Error::ResourceExceeded { requested: 4096, limit: 2048, .. })
        ));
        assert!(check_memory_against(0, 2048).is_err());
        assert!(check_memory(total_memory_mib() + 1).is_err());
    }

    #[test]
    fn test_cpu_bound() {
        check_cpus(8, 8).unwrap();
        assert!(matches!(check_cpus(9, 8), Err(Error::ResourceExceeded { .. })));
        assert!(check_cpus(0, 8).is_err());
    }
}
