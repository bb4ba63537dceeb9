//! Construction-time configuration.
//!
//! Nothing in the core reads process-wide globals: directories, port ranges
//! and timeouts are all passed in here at construction.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::restart::RestartPolicy;

/// First port the Invigilator tries when binding its listener.
pub const MIN_PORT: u16 = 5483;

/// Last port the Invigilator tries when binding its listener. Clients scan
/// the same range to find the live daemon.
pub const MAX_PORT: u16 = 5582;

/// Smallest accepted update-check interval.
pub const MIN_UPDATE_INTERVAL: Duration = Duration::from_secs(60);

/// Largest accepted update-check interval (one week).
pub const MAX_UPDATE_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// A bootstrap endpoint handed to clients and freshly started vaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapEndpoint {
    /// Endpoint address.
    pub ip: String,

    /// Endpoint port.
    pub port: u16,
}

/// Configuration for the Invigilator daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvigilatorConfig {
    /// First port to try when binding the listener.
    #[serde(default = "default_min_port")]
    pub min_port: u16,

    /// Last port to try when binding the listener.
    #[serde(default = "default_max_port")]
    pub max_port: u16,

    /// Vault worker program to spawn.
    #[serde(default = "default_vault_program")]
    pub vault_program: PathBuf,

    /// Directory scanned for newer releases; update notifications are
    /// disabled when unset.
    #[serde(default)]
    pub updates_dir: Option<PathBuf>,

    /// Bootstrap endpoints handed to validated clients and new vaults.
    #[serde(default)]
    pub bootstrap_endpoints: Vec<BootstrapEndpoint>,

    /// How long an unvalidated client may sit on its challenge.
    #[serde(default = "default_challenge_timeout")]
    #[serde(with = "humantime_serde")]
    pub challenge_timeout: Duration,

    /// Deadline for request/response exchanges with workers.
    #[serde(default = "default_rpc_timeout")]
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,

    /// Interval between update checks.
    #[serde(default = "default_update_interval")]
    #[serde(with = "humantime_serde")]
    pub update_interval: Duration,

    /// Restart policy applied to vault workers that exit unexpectedly.
    #[serde(default)]
    pub restart: RestartPolicy,
}

const fn default_min_port() -> u16 {
    MIN_PORT
}

const fn default_max_port() -> u16 {
    MAX_PORT
}

fn default_vault_program() -> PathBuf {
    PathBuf::from("vigil-vault")
}

const fn default_challenge_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_rpc_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_update_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

impl Default for InvigilatorConfig {
    fn default() -> Self {
        Self {
            min_port: default_min_port(),
            max_port: default_max_port(),
            vault_program: default_vault_program(),
            updates_dir: None,
            bootstrap_endpoints: Vec::new(),
            challenge_timeout: default_challenge_timeout(),
            rpc_timeout: default_rpc_timeout(),
            update_interval: default_update_interval(),
            restart: RestartPolicy::default(),
        }
    }
}

/// Configuration for a vault worker's local chunk storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Root directory of the permanent chunk store.
    pub chunk_dir: PathBuf,

    /// Cache capacity in bytes; 0 means unbounded.
    #[serde(default)]
    pub cache_capacity: u64,

    /// Number of sharding levels under the chunk directory.
    #[serde(default = "default_shard_depth")]
    pub shard_depth: usize,
}

const fn default_shard_depth() -> usize {
    3
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            chunk_dir: std::env::temp_dir().join("vigil-chunks"),
            cache_capacity: 0,
            shard_depth: default_shard_depth(),
        }
    }
}

/// Serde shim for human-readable [`Duration`] fields ("10s", "1h").
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes a duration in humantime notation.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    /// Deserializes a duration from humantime notation.
    ///
    /// # Errors
    ///
    /// Returns an error when the string is not a valid duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
