//! CLI command implementations.
//!
//! Every command lives under `ovm machine`:
//! - init: create or re-initialise a machine
//! - start: boot a machine and supervise it until it stops
//! - stop: stop a running machine
//! - set: change settings of a stopped machine
//! - list: show machines of the active provider
//! - reset: remove every machine and all bookkeeping
//! - cmd-proxy: (internal) SSH command proxy spawned by start

pub mod cmd_proxy;
pub mod init;
pub mod list;
pub mod reset;
pub mod set;
pub mod start;
pub mod stop;

use clap::Subcommand;
use ovm::config::OvmConfig;
use ovm::machine::shim::Orchestrator;
use ovm::paths::OvmPaths;
use ovm::process::ProcessRegistry;
use ovm::provider::{self, SharedProvider};
use std::sync::Arc;

/// Shared state for one invocation.
pub struct Context {
    pub config: OvmConfig,
    pub paths: OvmPaths,
    pub registry: Arc<ProcessRegistry>,
}

impl Context {
    pub fn new(config: OvmConfig, paths: OvmPaths, registry: Arc<ProcessRegistry>) -> Self {
        Self {
            config,
            paths,
            registry,
        }
    }

    /// The provider compiled in for this host.
    pub fn provider(&self) -> ovm::Result<SharedProvider> {
        provider::get_system_provider(&self.config, &self.paths)
    }

    /// An orchestrator over the system provider.
    pub fn orchestrator(&self) -> ovm::Result<Orchestrator> {
        self.orchestrator_with(self.config.clone())
    }

    /// An orchestrator using `config` instead of the loaded one.
    pub fn orchestrator_with(&self, config: OvmConfig) -> ovm::Result<Orchestrator> {
        Ok(Orchestrator::new(
            self.provider()?,
            config,
            self.paths.clone(),
            self.registry.clone(),
        ))
    }
}

/// Manage machines
#[derive(Subcommand, Debug)]
pub enum MachineCmd {
    /// Create or re-initialise a machine
    Init(init::InitCmd),

    /// Start a machine and stay attached until it stops
    Start(start::StartCmd),

    /// Stop a machine
    Stop(stop::StopCmd),

    /// Change settings of a stopped machine
    Set(set::SetCmd),

    /// List machines
    #[command(alias = "ls")]
    List(list::ListCmd),

    /// Remove all machines and machine state
    Reset(reset::ResetCmd),

    /// Serve the SSH command proxy for a running machine
    #[command(hide = true)]
    CmdProxy(cmd_proxy::CmdProxyCmd),
}

impl MachineCmd {
    pub async fn run(self, ctx: &Context) -> ovm::Result<()> {
        match self {
            MachineCmd::Init(cmd) => cmd.run(ctx).await,
            MachineCmd::Start(cmd) => cmd.run(ctx).await,
            MachineCmd::Stop(cmd) => cmd.run(ctx),
            MachineCmd::Set(cmd) => cmd.run(ctx),
            MachineCmd::List(cmd) => cmd.run(ctx),
            MachineCmd::Reset(cmd) => cmd.run(ctx),
            MachineCmd::CmdProxy(cmd) => cmd.run(ctx).await,
        }
    }
}

/// Machine name from an optional positional argument.
pub fn machine_name(name: Option<String>) -> String {
    name.unwrap_or_else(|| ovm::machine::DEFAULT_MACHINE_NAME.to_string())
}
