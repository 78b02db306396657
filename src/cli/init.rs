//! Init command implementation.

use super::{machine_name, Context};
use clap::Args;
use ovm::machine::InitOptions;
use std::path::PathBuf;

/// Create or re-initialise a machine.
#[derive(Args, Debug)]
pub struct InitCmd {
    /// Machine name (default: "default").
    pub name: Option<String>,

    /// Boot image (raw, .gz or .zst).
    #[arg(long, value_name = "PATH")]
    pub boot: Option<PathBuf>,

    /// Version label of the boot image; an unchanged label skips re-copying.
    #[arg(long, default_value = "")]
    pub boot_version: String,

    /// Version label of the data disk; a changed label recreates it.
    #[arg(long, default_value = "")]
    pub data_version: String,

    /// Number of vCPUs.
    #[arg(long)]
    pub cpus: Option<u32>,

    /// Memory in MiB.
    #[arg(long)]
    pub memory: Option<u64>,

    /// Data disk size in GiB.
    #[arg(long)]
    pub disk_size: Option<u64>,

    /// Share a host directory (SRC:DST[:ro]).
    #[arg(short = 'v', long = "volume", value_name = "SRC:DST[:ro]")]
    pub volumes: Vec<String>,

    /// Existing SSH private key for the guest.
    #[arg(long, value_name = "PATH")]
    pub identity: Option<PathBuf>,

    /// Guest user for SSH.
    #[arg(long)]
    pub username: Option<String>,

    /// Run the guest API socket as root.
    #[arg(long)]
    pub rootful: bool,

    /// Supervising process; init aborts if it is gone.
    #[arg(long)]
    pub ppid: Option<u32>,
}

impl InitCmd {
    /// Execute the init command.
    pub async fn run(self, ctx: &Context) -> ovm::Result<()> {
        let opts = InitOptions {
            name: machine_name(self.name),
            ppid: self.ppid,
            boot_image: self.boot,
            boot_version: self.boot_version,
            data_version: self.data_version,
            cpus: self.cpus.unwrap_or(ctx.config.default_cpus),
            memory: self.memory.unwrap_or(ctx.config.default_memory),
            disk_size: self.disk_size.unwrap_or(ctx.config.default_disk_size),
            volumes: self.volumes,
            identity_path: self.identity,
            remote_username: self
                .username
                .unwrap_or_else(|| ctx.config.remote_username.clone()),
            rootful: self.rootful,
        };

        let mc = ctx.orchestrator()?.init(opts).await?;
        println!("Machine {} initialised ({})", mc.name, mc.vm_type);
        Ok(())
    }
}
