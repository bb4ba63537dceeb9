//! vigil CLI — talk to the Invigilator.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vigil_client::ClientController;
use vigil_core::config::{MAX_PORT, MIN_PORT};
use vigil_core::crypto::VaultKeys;

/// Vault control client.
#[derive(Parser, Debug)]
#[command(name = "vigil", version, about, long_about = None)]
struct Cli {
    /// First port to scan for the invigilator.
    #[arg(long, default_value_t = MIN_PORT)]
    min_port: u16,

    /// Last port to scan for the invigilator.
    #[arg(long, default_value_t = MAX_PORT)]
    max_port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a new vault and wait for it to join the network.
    StartVault {
        /// Account the vault belongs to.
        #[arg(long)]
        account: String,

        /// File the generated vault keys are written to (hex).
        #[arg(long)]
        keys_out: PathBuf,
    },

    /// Stop a vault, proving ownership with its key file.
    StopVault {
        /// Key file written by `start-vault`.
        #[arg(long)]
        keys: PathBuf,
    },

    /// Print the invigilator's update-check interval.
    GetUpdateInterval,

    /// Change the invigilator's update-check interval.
    SetUpdateInterval {
        /// New interval, e.g. "30m" or "2h".
        interval: humantime::Duration,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let controller =
        ClientController::connect_to_range(VaultKeys::generate(), cli.min_port, cli.max_port)
            .await
            .context("failed to reach the invigilator")?;

    match cli.command {
        Command::StartVault { account, keys_out } => {
            let vault_keys = VaultKeys::generate();
            std::fs::write(&keys_out, hex::encode(&*vault_keys.to_bytes()))
                .with_context(|| format!("failed to write {}", keys_out.display()))?;
            controller.start_vault(&vault_keys, &account).await?;
            println!("vault {} joined", vault_keys.identity());
        }
        Command::StopVault { keys } => {
            let text = std::fs::read_to_string(&keys)
                .with_context(|| format!("failed to read {}", keys.display()))?;
            let Ok(bytes) = hex::decode(text.trim()) else {
                bail!("{} is not a hex key file", keys.display());
            };
            let vault_keys =
                VaultKeys::from_bytes(&bytes).context("key file holds no valid secret key")?;
            controller.stop_vault(&vault_keys).await?;
            println!("vault {} stopped", vault_keys.identity());
        }
        Command::GetUpdateInterval => {
            let interval = controller.get_update_interval().await?;
            println!("{}", humantime::format_duration(interval));
        }
        Command::SetUpdateInterval { interval } => {
            controller.set_update_interval(interval.into()).await?;
            println!("update interval set to {interval}");
        }
    }
    Ok(())
}
