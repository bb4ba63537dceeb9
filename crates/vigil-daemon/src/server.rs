//! Listener and connection handling.
//!
//! The Invigilator binds the first free port of its configured loopback
//! range and serves each accepted connection from its own task. Clients and
//! vault workers share the listener; they are told apart by the messages
//! they send.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use vigil_core::config::InvigilatorConfig;
use vigil_core::transport::{bind_in_range, Connection, MessageSender};
use vigil_core::wire;

use crate::client_connections::{ClientConnections, ConnectionId};
use crate::dispatch;
use crate::error::DaemonError;
use crate::update;
use crate::vaults::VaultSupervisor;

/// Send handles for every live connection, so vault events and update
/// notifications can be pushed to clients.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    senders: Arc<Mutex<HashMap<ConnectionId, MessageSender>>>,
}

impl ConnectionRegistry {
    /// Registers a connection's send handle.
    pub fn insert(&self, connection: ConnectionId, sender: MessageSender) {
        self.senders.lock().unwrap().insert(connection, sender);
    }

    /// Drops a connection's send handle.
    pub fn remove(&self, connection: ConnectionId) {
        self.senders.lock().unwrap().remove(&connection);
    }

    /// Pushes a frame to one connection; `false` when it is gone.
    #[must_use]
    pub fn send_to(&self, connection: ConnectionId, frame: Bytes) -> bool {
        let sender = {
            let senders = self.senders.lock().unwrap();
            senders.get(&connection).cloned()
        };
        sender.is_some_and(|sender| sender.send(frame).is_ok())
    }
}

/// Shared state of a running Invigilator.
pub struct Invigilator {
    /// The daemon configuration.
    pub config: Arc<InvigilatorConfig>,

    /// Port the listener is bound to.
    pub port: u16,

    /// Client connection registry.
    pub connections: ClientConnections,

    /// Send handles of live connections.
    pub registry: ConnectionRegistry,

    /// Vault records and worker supervision.
    pub vaults: Arc<VaultSupervisor>,

    /// Current update-check interval.
    pub update_interval: Mutex<Duration>,

    next_connection: AtomicU64,
}

/// Binds the listener and starts serving in background tasks.
///
/// # Errors
///
/// Returns [`DaemonError::Transport`] when no port in the configured range
/// is free.
pub async fn start(config: InvigilatorConfig) -> Result<Arc<Invigilator>, DaemonError> {
    let (listener, port) = bind_in_range(config.min_port, config.max_port).await?;
    let config = Arc::new(config);
    let registry = ConnectionRegistry::default();
    let state = Arc::new(Invigilator {
        connections: ClientConnections::new(config.challenge_timeout),
        registry: registry.clone(),
        vaults: VaultSupervisor::new(Arc::clone(&config), port, registry),
        update_interval: Mutex::new(config.update_interval),
        next_connection: AtomicU64::new(0),
        config,
        port,
    });

    tokio::spawn(accept_loop(Arc::clone(&state), listener));
    tokio::spawn(update::run(Arc::clone(&state)));
    info!(port, "invigilator listening");
    Ok(state)
}

async fn accept_loop(state: Arc<Invigilator>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => match Connection::from_stream(stream) {
                Ok(connection) => {
                    let id = state.next_connection.fetch_add(1, Ordering::SeqCst);
                    state.registry.insert(id, connection.sender());
                    tokio::spawn(handle_connection(Arc::clone(&state), id, connection));
                }
                Err(error) => warn!(%error, "failed to adopt accepted connection"),
            },
            Err(error) => warn!(%error, "accept failed"),
        }
    }
}

async fn handle_connection(state: Arc<Invigilator>, id: ConnectionId, mut connection: Connection) {
    debug!(connection = id, peer_port = connection.peer_port(), "connection opened");
    while let Some(frame) = connection.recv().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(error) => {
                warn!(connection = id, %error, "transport error");
                break;
            }
        };
        match wire::unwrap_message(&frame) {
            Ok((message_type, body)) => {
                match dispatch::handle(&state, id, &connection, message_type, &body).await {
                    Ok(Some(reply)) => {
                        if connection.send(reply).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(error) => {
                        warn!(connection = id, %error, "closing connection after failed request");
                        break;
                    }
                }
            }
            Err(error) => {
                warn!(connection = id, %error, "malformed frame; closing connection");
                break;
            }
        }
    }
    state.registry.remove(id);
    state.connections.remove(id);
    debug!(connection = id, "connection closed");
}
