//! Start command implementation.

use super::{machine_name, Context};
use clap::Args;
use ovm::machine::StartOptions;
use std::net::SocketAddr;
use std::time::Duration;

/// Start a stopped machine.
///
/// Stays in the foreground until the machine stops.
#[derive(Args, Debug)]
pub struct StartCmd {
    /// Machine name (default: "default").
    pub name: Option<String>,

    /// Supervising process; the machine is torn down when it exits.
    #[arg(long)]
    pub ppid: Option<u32>,

    /// URL that receives progress events.
    #[arg(long, value_name = "URL")]
    pub report_url: Option<String>,

    /// Control-plane listen address.
    #[arg(long, value_name = "ADDR")]
    pub api_listen: Option<SocketAddr>,

    /// Do not launch the SSH command proxy.
    #[arg(long)]
    pub no_cmd_proxy: bool,

    /// How long to wait for the guest to boot (e.g. "90s", "2m").
    #[arg(long, value_parser = humantime::parse_duration)]
    pub ready_timeout: Option<Duration>,
}

impl StartCmd {
    /// Execute the start command.
    pub async fn run(self, ctx: &Context) -> ovm::Result<()> {
        let name = machine_name(self.name);

        let mut config = ctx.config.clone();
        if let Some(timeout) = self.ready_timeout {
            config.ready_timeout = timeout;
        }

        let opts = StartOptions {
            ppid: self.ppid,
            report_url: self.report_url,
            api_listen: self.api_listen,
            command_proxy: !self.no_cmd_proxy,
        };

        println!("Starting machine {}...", name);
        ctx.orchestrator_with(config)?.start(&name, opts).await?;
        println!("Machine {} stopped", name);
        Ok(())
    }
}
