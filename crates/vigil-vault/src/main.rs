//! vigil-vault worker binary.
//!
//! Spawned by the Invigilator with `--invigilator_identifier
//! <port>:<process_index>`. Exits 0 on a clean shutdown and non-zero when
//! the identity handshake fails.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

use vigil_core::chunk_store::{DefaultChunkActionAuthority, WriteExecutor};
use vigil_core::config::VaultConfig;
use vigil_vault::{VaultController, VaultService};

/// Vault worker process.
#[derive(Parser, Debug)]
#[command(name = "vigil-vault", version, about, long_about = None)]
struct Args {
    /// Identifier handed down by the invigilator, `<port>:<process_index>`.
    #[arg(long = "invigilator_identifier")]
    invigilator_identifier: String,

    /// Chunk storage directory; defaults to a per-identity directory under
    /// the system temp dir.
    #[arg(long)]
    chunk_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let (stopped, stop_requested) = tokio::sync::oneshot::channel();
    let controller = VaultController::start(&args.invigilator_identifier, move || {
        let _ = stopped.send(());
    })
    .await
    .context("failed to obtain vault identity")?;

    let identity = controller.identity();
    let config = VaultConfig {
        chunk_dir: args
            .chunk_dir
            .unwrap_or_else(|| std::env::temp_dir().join(format!("vigil-vault-{identity}"))),
        ..Default::default()
    };
    let _service = VaultService::new(
        &config,
        WriteExecutor::default(),
        Arc::new(DefaultChunkActionAuthority),
    )
    .context("failed to open the chunk store")?;

    controller
        .confirm_join(true)
        .await
        .context("join confirmation failed")?;
    info!(identity, "vault joined the network");

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        _ = stop_requested => info!("shutdown requested by the invigilator"),
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        _ = sigterm.recv() => info!("terminated"),
    }
    Ok(())
}
