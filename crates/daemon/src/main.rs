//! Nexa node daemon
//!
//! Loads settings and runs a node until interrupted.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use nexa_daemon::run_node;
use nexa_settings::{default_settings_path, Settings};

#[derive(Parser)]
#[command(name = "nexad")]
#[command(about = "Nexa node daemon")]
#[command(version)]
struct Args {
    /// Settings file (created with defaults when missing)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Fallback log filter when RUST_LOG is unset
    #[arg(long, default_value = nexa_logging::DEFAULT_FILTER)]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    nexa_logging::init_logging(&args.log);

    let path = args.config.unwrap_or_else(default_settings_path);
    let settings = Settings::load_from(&path)
        .with_context(|| format!("loading settings from {}", path.display()))?;
    if !path.exists() {
        settings.save()?;
    }

    tracing::info!("Starting Nexa node with settings {}", path.display());
    run_node(settings).await?;
    tracing::info!("Daemon stopped");
    Ok(())
}
