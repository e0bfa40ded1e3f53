//! DockerPilot operator binary
//!
//! Thin shim over the engine facade: wires configuration and logging, then
//! dispatches one subcommand. The richer API/UI layers live elsewhere and
//! speak to the same facade.

use anyhow::Result;
use clap::Parser;
use tracing::error;

mod cmd;

#[derive(Parser)]
#[command(name = "dockerpilot")]
#[command(about = "Deploy, promote, and migrate Dockerized applications")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: cmd::Commands,

    /// Path to configuration file
    #[arg(short, long, default_value = "dockerpilot.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("dockerpilot={}", log_level).into()),
        )
        .init();

    if let Err(e) = cmd::run(&cli.config, cli.command).await {
        error!("{}", e);
        std::process::exit(1);
    }

    Ok(())
}
