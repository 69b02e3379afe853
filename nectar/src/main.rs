use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nectar")]
#[command(version, about = "Interactive SSH/SFTP honeypot", long_about = None)]
struct Cli {
    /// Working directory holding config.json, the filesystem image, and the
    /// host key
    #[arg(short = 'c', long = "config", default_value = ".")]
    config: PathBuf,
}

/// Stdout gets the human format; `logs/activity.log` gets structured JSON
/// for ingestion.
fn init_tracing() -> Result<()> {
    std::fs::create_dir_all("logs/sessions").context("failed to create logs directory")?;
    let activity = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open("logs/activity.log")
        .context("failed to open activity log")?;
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(Mutex::new(activity)),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing()?;
    nectar::run(&cli.config).await
}
