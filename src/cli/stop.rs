//! Stop command implementation.

use super::{machine_name, Context};
use clap::Args;

/// Stop a machine.
#[derive(Args, Debug)]
pub struct StopCmd {
    /// Machine name (default: "default").
    pub name: Option<String>,

    /// Kill the hypervisor instead of asking the guest to shut down.
    #[arg(short, long)]
    pub force: bool,
}

impl StopCmd {
    /// Execute the stop command.
    pub fn run(self, ctx: &Context) -> ovm::Result<()> {
        let name = machine_name(self.name);
        ctx.orchestrator()?.stop(&name, self.force)?;
        println!("Machine {} stopped", name);
        Ok(())
    }
}
