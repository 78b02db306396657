//! Command proxy implementation.
//!
//! Spawned by `machine start`; forwards `POST /exec` to the guest over SSH.

use super::Context;
use clap::Args;
use ovm::api::{self, ProxyState};
use ovm::machine::MachineConfig;
use ovm::process;
use ovm::ssh::SshTarget;
use ovm::watchdog::Watchdog;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Serve the SSH command proxy for a running machine.
#[derive(Args, Debug)]
pub struct CmdProxyCmd {
    /// Machine name.
    pub name: String,

    /// Exit when this process exits.
    #[arg(long)]
    pub ppid: Option<u32>,

    /// Listen port on 127.0.0.1 (default from config).
    #[arg(long)]
    pub port: Option<u16>,

    /// Default per-command timeout (e.g. "60s").
    #[arg(long, value_parser = humantime::parse_duration, default_value = "60s")]
    pub timeout: Duration,
}

impl CmdProxyCmd {
    /// Execute the command proxy.
    pub async fn run(self, ctx: &Context) -> ovm::Result<()> {
        let provider = ctx.provider()?;
        let dirs = ctx.paths.machine_dirs(provider.vm_type());
        let mc = MachineConfig::load_by_name(&self.name, &dirs)?;

        let state = Arc::new(ProxyState {
            machine: mc.name.clone(),
            target: SshTarget::for_machine(&mc),
            default_timeout: self.timeout,
        });

        let port = self.port.unwrap_or(ctx.config.cmd_proxy_port);
        let listener = api::bind(SocketAddr::from(([127, 0, 0, 1], port))).await?;

        let ppid = self.ppid.unwrap_or_else(process::parent_pid);
        let (_cancel, cancel_rx) = watch::channel(false);
        let parent_gone = async move {
            let event = Watchdog::new(ppid, Arc::default()).run(cancel_rx).await;
            tracing::info!(?event, "command proxy shutting down");
        };

        api::serve(listener, api::cmd_proxy_router(state), parent_gone).await
    }
}
