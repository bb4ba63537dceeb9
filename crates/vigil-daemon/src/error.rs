//! Daemon error type.

use vigil_core::crypto::CryptoError;
use vigil_core::transport::TransportError;
use vigil_core::wire::WireError;

use crate::client_connections::ConnectionsError;

/// Errors raised while serving the control plane.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// Connection registry refusal (unvalidated client, bad signature…).
    #[error(transparent)]
    Connections(#[from] ConnectionsError),

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Envelope or body decoding failure.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Key or signature failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// The vault worker process could not be spawned.
    #[error("failed to spawn vault worker: {0}")]
    SpawnFailed(String),

    /// No supervised vault carries the given identity.
    #[error("vault '{0}' not found")]
    VaultNotFound(String),

    /// An exchange with a worker exceeded its deadline.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}
