//! vigil-daemon binary.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

use vigil_core::config::InvigilatorConfig;

/// The vigil Invigilator: supervises vault worker processes.
#[derive(Parser, Debug)]
#[command(name = "vigil-daemon", version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the first port of the listening range.
    #[arg(long)]
    min_port: Option<u16>,

    /// Override the last port of the listening range.
    #[arg(long)]
    max_port: Option<u16>,

    /// Override the vault worker program.
    #[arg(long)]
    vault_program: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<InvigilatorConfig>(&text)
                .with_context(|| format!("failed to parse {}", path.display()))?
        }
        None => InvigilatorConfig::default(),
    };
    if let Some(min_port) = args.min_port {
        config.min_port = min_port;
    }
    if let Some(max_port) = args.max_port {
        config.max_port = max_port;
    }
    if let Some(vault_program) = args.vault_program {
        config.vault_program = vault_program;
    }

    let state = vigil_daemon::server::start(config)
        .await
        .context("failed to start the invigilator")?;
    info!(port = state.port, "invigilator running");

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    info!("shutting down");
    Ok(())
}
