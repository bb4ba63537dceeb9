//! Connection back to the Invigilator.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::net::Ipv6Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use vigil_core::config::BootstrapEndpoint;
use vigil_core::crypto::{CryptoError, VaultKeys};
use vigil_core::transport::{Connection, MessageSender, TransportError};
use vigil_core::wire::{self, decode_body, messages, MessageType, WireError};

/// Deadline for the identity exchange after start-up.
const IDENTITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for join acknowledgements.
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised by the vault controller.
#[derive(Debug, thiserror::Error)]
pub enum VaultControllerError {
    /// The `--invigilator_identifier` value was not `<port>:<index>`.
    #[error("invalid invigilator identifier '{0}'")]
    InvalidIdentifier(String),

    /// The Invigilator did not recognize our process index.
    #[error("identity refused by the invigilator")]
    IdentityRefused,

    /// A deadline elapsed.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Envelope or body decoding failure.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The delivered key material was malformed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Parses an invigilator identifier of the form `<port>:<process_index>`.
///
/// # Errors
///
/// Returns [`VaultControllerError::InvalidIdentifier`] when either half is
/// missing or not numeric.
pub fn parse_identifier(identifier: &str) -> Result<(u16, u32), VaultControllerError> {
    let invalid = || VaultControllerError::InvalidIdentifier(identifier.to_string());
    let (port, index) = identifier.split_once(':').ok_or_else(invalid)?;
    Ok((
        port.parse().map_err(|_| invalid())?,
        index.parse().map_err(|_| invalid())?,
    ))
}

type StopCallback = Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>;
type JoinAckSlot = Arc<Mutex<Option<oneshot::Sender<bool>>>>;

/// Companion object giving a vault worker its identity and lifecycle hooks.
pub struct VaultController {
    keys: VaultKeys,
    account_name: String,
    bootstrap: Vec<BootstrapEndpoint>,
    listening_port: u16,
    outbound: MessageSender,
    join_acks: JoinAckSlot,
}

impl VaultController {
    /// Connects to the Invigilator named by `identifier`, requests the
    /// vault's identity and blocks for up to ten seconds until it arrives.
    /// `stop` runs once when a shutdown request is received.
    ///
    /// # Errors
    ///
    /// Returns [`VaultControllerError::Timeout`] when the identity does not
    /// arrive in time and [`VaultControllerError::IdentityRefused`] when
    /// the Invigilator does not know the process index.
    pub async fn start(
        identifier: &str,
        stop: impl FnOnce() + Send + 'static,
    ) -> Result<Self, VaultControllerError> {
        let (invigilator_port, process_index) = parse_identifier(identifier)?;

        let listener = TcpListener::bind((Ipv6Addr::LOCALHOST, 0))
            .await
            .map_err(TransportError::from)?;
        let listening_port = listener
            .local_addr()
            .map_err(TransportError::from)?
            .port();

        let mut conn = Connection::connect(invigilator_port).await?;
        conn.send(wire::wrap_message(
            MessageType::VaultIdentityRequest,
            &messages::VaultIdentityRequest {
                process_index,
                listening_port: u32::from(listening_port),
            },
        ))?;

        let response = timeout(IDENTITY_TIMEOUT, receive_identity(&mut conn))
            .await
            .map_err(|_| VaultControllerError::Timeout("vault identity"))??;
        if !response.result {
            return Err(VaultControllerError::IdentityRefused);
        }
        let keys = VaultKeys::from_bytes(&response.keys)?;
        let bootstrap = response
            .bootstrap_endpoint_ip
            .into_iter()
            .zip(response.bootstrap_endpoint_port)
            .map(|(ip, port)| BootstrapEndpoint {
                ip,
                #[allow(clippy::cast_possible_truncation)] // ports fit in u16
                port: port as u16,
            })
            .collect();
        info!(identity = keys.identity(), listening_port, "vault identity received");

        let stop: StopCallback = Arc::new(Mutex::new(Some(Box::new(stop))));
        spawn_shutdown_listener(listener, stop);

        let join_acks: JoinAckSlot = Arc::new(Mutex::new(None));
        let outbound = conn.sender();
        spawn_control_reader(conn, Arc::clone(&join_acks));

        Ok(Self {
            keys,
            account_name: response.account_name,
            bootstrap,
            listening_port,
            outbound,
            join_acks,
        })
    }

    /// The vault's identity handle.
    #[must_use]
    pub fn identity(&self) -> String {
        self.keys.identity()
    }

    /// The vault's keys.
    #[must_use]
    pub fn keys(&self) -> &VaultKeys {
        &self.keys
    }

    /// Account the vault belongs to.
    #[must_use]
    pub fn account_name(&self) -> &str {
        &self.account_name
    }

    /// Bootstrap endpoints delivered with the identity.
    #[must_use]
    pub fn bootstrap_nodes(&self) -> &[BootstrapEndpoint] {
        &self.bootstrap
    }

    /// Port of the local shutdown listener.
    #[must_use]
    pub fn listening_port(&self) -> u16 {
        self.listening_port
    }

    /// Reports the join outcome to the Invigilator and waits for the
    /// acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`VaultControllerError::Timeout`] when no acknowledgement
    /// arrives within the deadline.
    pub async fn confirm_join(&self, joined: bool) -> Result<(), VaultControllerError> {
        let (ack, ack_received) = oneshot::channel();
        *self.join_acks.lock().unwrap() = Some(ack);
        self.outbound.send(wire::wrap_message(
            MessageType::VaultJoinedNetwork,
            &messages::VaultJoinedNetwork {
                identity: self.identity(),
                joined,
            },
        ))?;
        match timeout(RPC_TIMEOUT, ack_received).await {
            Ok(Ok(_acknowledged)) => Ok(()),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed.into()),
            Err(_) => {
                self.join_acks.lock().unwrap().take();
                Err(VaultControllerError::Timeout("join acknowledgement"))
            }
        }
    }
}

async fn receive_identity(
    conn: &mut Connection,
) -> Result<messages::VaultIdentityResponse, VaultControllerError> {
    while let Some(frame) = conn.recv().await {
        let frame = frame?;
        if let Ok((MessageType::VaultIdentityResponse, body)) = wire::unwrap_message(&frame) {
            return Ok(decode_body(&body)?);
        }
    }
    Err(TransportError::ConnectionClosed.into())
}

fn spawn_shutdown_listener(listener: TcpListener, stop: StopCallback) {
    tokio::spawn(async move {
        loop {
            let Ok((stream, _peer)) = listener.accept().await else {
                return;
            };
            let Ok(mut conn) = Connection::from_stream(stream) else {
                continue;
            };
            let stop = Arc::clone(&stop);
            tokio::spawn(async move {
                while let Some(Ok(frame)) = conn.recv().await {
                    match wire::unwrap_message(&frame) {
                        Ok((MessageType::VaultShutdownRequest, _body)) => {
                            let _ = conn.send(wire::wrap_message(
                                MessageType::VaultShutdownResponse,
                                &messages::VaultShutdownResponse { acknowledged: true },
                            ));
                            // give the acknowledgement a moment on the wire
                            // before the stop callback tears the worker down
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            if let Some(stop) = stop.lock().unwrap().take() {
                                stop();
                            }
                            return;
                        }
                        Ok((other, _body)) => {
                            debug!(?other, "ignoring message on the shutdown listener");
                        }
                        Err(error) => {
                            warn!(%error, "malformed frame on the shutdown listener");
                            return;
                        }
                    }
                }
            });
        }
    });
}

fn spawn_control_reader(mut conn: Connection, join_acks: JoinAckSlot) {
    tokio::spawn(async move {
        while let Some(frame) = conn.recv().await {
            let Ok(frame) = frame else { break };
            match wire::unwrap_message(&frame) {
                Ok((MessageType::VaultJoinedNetworkAck, body)) => {
                    match decode_body::<messages::VaultJoinedNetworkAck>(&body) {
                        Ok(ack) => {
                            if let Some(waiter) = join_acks.lock().unwrap().take() {
                                let _ = waiter.send(ack.ack);
                            }
                        }
                        Err(error) => warn!(%error, "malformed join acknowledgement"),
                    }
                }
                Ok((other, _body)) => debug!(?other, "unsolicited message from the invigilator"),
                Err(error) => warn!(%error, "malformed frame from the invigilator"),
            }
        }
        debug!("invigilator connection closed");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_parsing() {
        assert_eq!(parse_identifier("5483:7").unwrap(), (5483, 7));
        assert_eq!(parse_identifier("80:0").unwrap(), (80, 0));

        for bad in ["", "5483", ":", "5483:", ":7", "port:7", "5483:index", "70000:1"] {
            assert!(matches!(
                parse_identifier(bad),
                Err(VaultControllerError::InvalidIdentifier(_))
            ));
        }
    }
}
