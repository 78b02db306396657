//! ovm CLI entry point.

use clap::{Parser, Subcommand};
use ovm::config::OvmConfig;
use ovm::paths::OvmPaths;
use ovm::process::{ProcessRegistry, SIGKILL_WAIT};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod cli;

/// Grace period for in-flight background work after the command ends.
const RUNTIME_SHUTDOWN: Duration = Duration::from_secs(5);

/// ovm - local lightweight virtual machines
#[derive(Parser, Debug)]
#[command(name = "ovm")]
#[command(about = "Lifecycle orchestration for local lightweight virtual machines")]
#[command(version)]
struct Cli {
    /// Log filter used when RUST_LOG is unset (e.g. "debug", "ovm=trace").
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage machines (init, start, stop, set, list, reset).
    #[command(subcommand)]
    Machine(cli::MachineCmd),
}

fn main() {
    let cli = Cli::parse();

    init_logging(cli.log_level.as_deref());

    tracing::debug!(version = ovm::VERSION, "starting ovm");

    let paths = match OvmPaths::from_env() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let config = match OvmConfig::load(&paths) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            OvmConfig::default()
        }
    };

    let registry = Arc::new(ProcessRegistry::new());
    let ctx = cli::Context::new(config, paths, registry.clone());

    let result = match tokio::runtime::Runtime::new() {
        Ok(runtime) => {
            let result = runtime.block_on(async {
                let command = async {
                    match cli.command {
                        Commands::Machine(cmd) => cmd.run(&ctx).await,
                    }
                };
                tokio::select! {
                    result = command => result,
                    _ = shutdown_signal() => Err(ovm::Error::Interrupted),
                }
            });
            runtime.shutdown_timeout(RUNTIME_SHUTDOWN);
            result
        }
        Err(e) => Err(ovm::Error::Io(e)),
    };

    // Helpers never outlive the invocation that started them.
    registry.kill_all(SIGKILL_WAIT);

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
fn init_logging(level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("ovm=info")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("termination signal received");
}
