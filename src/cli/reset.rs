//! Reset command implementation.

use super::Context;
use clap::Args;
use ovm::machine::shim;
use ovm::provider;
use std::io::{BufRead, Write};

/// Remove every machine of every provider and all machine state.
#[derive(Args, Debug)]
pub struct ResetCmd {
    /// Do not ask for confirmation.
    #[arg(short, long)]
    pub force: bool,
}

impl ResetCmd {
    /// Execute the reset command.
    pub fn run(self, ctx: &Context) -> ovm::Result<()> {
        if !self.force && !confirm()? {
            println!("Reset cancelled");
            return Ok(());
        }

        let providers = provider::all_providers(&ctx.config, &ctx.paths);
        shim::reset(&providers, &ctx.paths)?;
        println!("All machines removed");
        Ok(())
    }
}

fn confirm() -> ovm::Result<bool> {
    print!("This removes all machines, images and data disks. Continue? [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}
