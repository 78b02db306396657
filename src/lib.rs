//! ovm - lifecycle orchestration for local lightweight virtual machines.
//!
//! A machine is a named guest backed by one hypervisor provider (krunkit,
//! vfkit or WSL2). The [`machine::shim::Orchestrator`] takes it through
//! init, start, stop and set while coordinating the helper processes a
//! running guest needs:
//!
//! - the hypervisor helper ([`provider`])
//! - the gvproxy user-mode network proxy ([`network`])
//! - the optional SSH command proxy ([`api`])
//!
//! State shared between independent `ovm` invocations (machine configs, the
//! SSH port reservations, the connection registry) lives in files guarded
//! by advisory locks ([`lock`]).

pub mod api;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod host;
pub mod lock;
pub mod machine;
pub mod network;
pub mod paths;
pub mod ports;
pub mod process;
pub mod provider;
pub mod report;
pub mod retry;
pub mod ssh;
pub mod util;
pub mod vmfile;
pub mod watchdog;

pub use error::{Error, Result};

/// Crate version reported by the control plane.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
