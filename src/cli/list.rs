//! List command implementation.

use super::Context;
use clap::Args;

/// List machines of the active provider.
#[derive(Args, Debug)]
pub struct ListCmd {
    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

impl ListCmd {
    /// Execute the list command.
    pub fn run(&self, ctx: &Context) -> ovm::Result<()> {
        let machines = ctx.orchestrator()?.list()?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&machines)?);
            return Ok(());
        }

        if machines.is_empty() {
            println!("No machines found");
            return Ok(());
        }

        println!(
            "{:<20} {:<9} {:<10} {:<5} {:<10} {:<8} {:<6}",
            "NAME", "TYPE", "STATE", "CPUS", "MEMORY", "DISK", "SSH"
        );
        println!("{}", "-".repeat(74));

        for m in machines {
            println!(
                "{:<20} {:<9} {:<10} {:<5} {:<10} {:<8} {:<6}",
                truncate(&m.name, 18),
                m.vm_type,
                m.state,
                m.cpus,
                format!("{} MiB", m.memory),
                format!("{} GiB", m.disk_size),
                m.ssh_port,
            );
        }

        Ok(())
    }
}

/// Truncate a string to max length, adding "..." if needed.
fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}...", &s[..max - 3])
    }
}
