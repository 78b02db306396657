//! Set command implementation.

use super::{machine_name, Context};
use clap::Args;
use ovm::machine::SetOptions;

/// Change settings of a stopped machine.
#[derive(Args, Debug)]
pub struct SetCmd {
    /// Machine name (default: "default").
    pub name: Option<String>,

    /// Number of vCPUs.
    #[arg(long)]
    pub cpus: Option<u32>,

    /// Memory in MiB.
    #[arg(long)]
    pub memory: Option<u64>,

    /// Replace the shared directories (SRC:DST[:ro]).
    #[arg(short = 'v', long = "volume", value_name = "SRC:DST[:ro]")]
    pub volumes: Vec<String>,

    /// Remove every shared directory.
    #[arg(long, conflicts_with = "volumes")]
    pub no_volumes: bool,
}

impl SetCmd {
    /// Execute the set command.
    pub fn run(self, ctx: &Context) -> ovm::Result<()> {
        let name = machine_name(self.name);
        let volumes = if self.no_volumes {
            Some(Vec::new())
        } else if self.volumes.is_empty() {
            None
        } else {
            Some(self.volumes)
        };

        let mc = ctx.orchestrator()?.set(
            &name,
            SetOptions {
                cpus: self.cpus,
                memory: self.memory,
                volumes,
            },
        )?;

        println!(
            "Machine {}: {} vCPU(s), {} MiB, {} mount(s)",
            mc.name,
            mc.resources.cpus,
            mc.resources.memory,
            mc.mounts.len()
        );
        Ok(())
    }
}
