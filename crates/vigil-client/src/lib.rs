//! vigil-client — the client controller.
//!
//! Scans the Invigilator's port range, validates the connection with a
//! challenge signature, and then drives the control plane: starting and
//! stopping vaults, tuning the update interval, and receiving server
//! pushes (join confirmations and new-version announcements) over the one
//! persistent connection.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use vigil_core::config::{
    BootstrapEndpoint, MAX_PORT, MAX_UPDATE_INTERVAL, MIN_PORT, MIN_UPDATE_INTERVAL,
};
use vigil_core::crypto::{random_challenge, CryptoError, VaultKeys};
use vigil_core::transport::{Connection, MessageSender, TransportError};
use vigil_core::wire::{self, decode_body, messages, MessageType, WireError};

/// Deadline for the registration and validation exchange.
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(3);

/// Deadline for request/response exchanges.
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for the join confirmation after a successful start.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised by the client controller.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// No Invigilator answered on any port of the range.
    #[error("no invigilator found on ports {min}..={max}")]
    InvigilatorNotFound {
        /// First port scanned.
        min: u16,
        /// Last port scanned.
        max: u16,
    },

    /// A deadline elapsed; a late reply will be discarded.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The Invigilator rejected the challenge signature.
    #[error("connection validation refused")]
    ValidationRefused,

    /// Another request of the same kind is already awaiting its reply.
    #[error("a request of this kind is already in flight")]
    RequestInFlight,

    /// The Invigilator refused to start the vault.
    #[error("start vault request refused")]
    StartVaultRefused,

    /// The vault reported that it failed to join the network.
    #[error("vault failed to join the network")]
    VaultJoinFailed,

    /// The Invigilator refused to stop the vault.
    #[error("stop vault request refused")]
    StopVaultRefused,

    /// The requested interval is outside the permitted range.
    #[error("update interval {0:?} outside the permitted range")]
    UpdateIntervalOutOfRange(Duration),

    /// The Invigilator signalled failure for an update-interval request.
    #[error("update interval request rejected")]
    UpdateIntervalRejected,

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Envelope or body decoding failure.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Key or signature failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

type NewVersionCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct Shared {
    outbound: MessageSender,
    pending: Mutex<HashMap<u16, oneshot::Sender<Bytes>>>,
    joining: Mutex<HashMap<String, oneshot::Sender<bool>>>,
    on_new_version: Mutex<Option<NewVersionCallback>>,
}

/// A validated connection to the Invigilator.
pub struct ClientController {
    keys: VaultKeys,
    invigilator_port: u16,
    bootstrap: Vec<BootstrapEndpoint>,
    shared: Arc<Shared>,
}

impl ClientController {
    /// Connects over the default port range.
    ///
    /// # Errors
    ///
    /// See [`ClientController::connect_to_range`].
    pub async fn connect(keys: VaultKeys) -> Result<Self, ClientError> {
        Self::connect_to_range(keys, MIN_PORT, MAX_PORT).await
    }

    /// Scans `min_port..=max_port` for the live Invigilator, registers and
    /// validates with `keys` within the registration deadline.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvigilatorNotFound`] when no port answers,
    /// [`ClientError::Timeout`] when registration stalls, and
    /// [`ClientError::ValidationRefused`] when the challenge signature is
    /// not accepted.
    pub async fn connect_to_range(
        keys: VaultKeys,
        min_port: u16,
        max_port: u16,
    ) -> Result<Self, ClientError> {
        let (mut conn, invigilator_port) = find_invigilator(min_port, max_port).await?;

        let registration = async {
            conn.send(wire::wrap_message(
                MessageType::ClientRegistrationRequest,
                &messages::ClientRegistrationRequest {
                    public_key_name: keys.identity(),
                    public_key: keys.public_key_bytes().to_vec(),
                },
            ))?;
            let challenge: messages::ClientRegistrationResponse =
                expect_response(&mut conn, MessageType::ClientRegistrationResponse).await?;

            conn.send(wire::wrap_message(
                MessageType::ClientValidationRequest,
                &messages::ClientValidationRequest {
                    signature: keys.sign(&challenge.challenge),
                },
            ))?;
            let validation: messages::ClientValidationResponse =
                expect_response(&mut conn, MessageType::ClientValidationResponse).await?;
            if validation.result {
                Ok(validation)
            } else {
                Err(ClientError::ValidationRefused)
            }
        };
        let validation = timeout(REGISTRATION_TIMEOUT, registration)
            .await
            .map_err(|_| ClientError::Timeout("registration"))??;
        info!(invigilator_port, "registered with the invigilator");

        let bootstrap = validation
            .bootstrap_endpoint_ip
            .into_iter()
            .zip(validation.bootstrap_endpoint_port)
            .map(|(ip, port)| BootstrapEndpoint {
                ip,
                #[allow(clippy::cast_possible_truncation)] // ports fit in u16
                port: port as u16,
            })
            .collect();

        let shared = Arc::new(Shared {
            outbound: conn.sender(),
            pending: Mutex::new(HashMap::new()),
            joining: Mutex::new(HashMap::new()),
            on_new_version: Mutex::new(None),
        });
        tokio::spawn(read_loop(conn, Arc::clone(&shared)));

        Ok(Self {
            keys,
            invigilator_port,
            bootstrap,
            shared,
        })
    }

    /// The client's identity handle.
    #[must_use]
    pub fn identity(&self) -> String {
        self.keys.identity()
    }

    /// Port the Invigilator was found on.
    #[must_use]
    pub fn invigilator_port(&self) -> u16 {
        self.invigilator_port
    }

    /// Bootstrap endpoints received at validation.
    #[must_use]
    pub fn bootstrap_endpoints(&self) -> &[BootstrapEndpoint] {
        &self.bootstrap
    }

    /// Installs the callback invoked with the path of every announced
    /// release.
    pub fn on_new_version(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        *self.shared.on_new_version.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Starts a vault with the given keys and waits for its join
    /// confirmation.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::StartVaultRefused`] when the Invigilator
    /// cannot launch the worker, [`ClientError::VaultJoinFailed`] when the
    /// vault reports a failed join, and [`ClientError::Timeout`] when
    /// either phase misses its deadline.
    pub async fn start_vault(
        &self,
        vault_keys: &VaultKeys,
        account_name: &str,
    ) -> Result<(), ClientError> {
        let identity = vault_keys.identity();
        let (confirmed, confirmation) = oneshot::channel();
        self.shared
            .joining
            .lock()
            .unwrap()
            .insert(identity.clone(), confirmed);

        let remove_waiter = || {
            self.shared.joining.lock().unwrap().remove(&identity);
        };

        let token = random_challenge();
        let request = messages::StartVaultRequest {
            account_name: account_name.to_string(),
            keys: vault_keys.to_bytes().to_vec(),
            token: token.clone(),
            token_signature: vault_keys.sign(&token),
        };
        let response: messages::StartVaultResponse = match self
            .rpc(
                MessageType::StartVaultRequest,
                &request,
                MessageType::StartVaultResponse,
            )
            .await
        {
            Ok(response) => response,
            Err(error) => {
                remove_waiter();
                return Err(error);
            }
        };
        if !response.result {
            remove_waiter();
            return Err(ClientError::StartVaultRefused);
        }

        match timeout(JOIN_TIMEOUT, confirmation).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(ClientError::VaultJoinFailed),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed.into()),
            Err(_) => {
                remove_waiter();
                Err(ClientError::Timeout("vault join confirmation"))
            }
        }
    }

    /// Stops a vault, proving ownership by signing a fresh token with its
    /// keys.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::StopVaultRefused`] when the Invigilator
    /// rejects the request.
    pub async fn stop_vault(&self, vault_keys: &VaultKeys) -> Result<(), ClientError> {
        let data = random_challenge();
        let request = messages::StopVaultRequest {
            signature: vault_keys.sign(&data),
            data,
            identity: vault_keys.identity(),
        };
        let response: messages::StopVaultResponse = self
            .rpc(
                MessageType::StopVaultRequest,
                &request,
                MessageType::StopVaultResponse,
            )
            .await?;
        if response.result {
            Ok(())
        } else {
            Err(ClientError::StopVaultRefused)
        }
    }

    /// Sets the update-check interval.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UpdateIntervalOutOfRange`] before touching
    /// the wire for intervals outside the permitted range, and
    /// [`ClientError::UpdateIntervalRejected`] when the Invigilator
    /// signals failure.
    pub async fn set_update_interval(&self, interval: Duration) -> Result<(), ClientError> {
        if interval < MIN_UPDATE_INTERVAL || interval > MAX_UPDATE_INTERVAL {
            return Err(ClientError::UpdateIntervalOutOfRange(interval));
        }
        let confirmed = self.update_interval_rpc(interval.as_secs()).await?;
        if confirmed == interval.as_secs() {
            Ok(())
        } else {
            Err(ClientError::UpdateIntervalRejected)
        }
    }

    /// Reads the current update-check interval.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UpdateIntervalRejected`] when the
    /// Invigilator signals failure.
    pub async fn get_update_interval(&self) -> Result<Duration, ClientError> {
        let seconds = self.update_interval_rpc(0).await?;
        if seconds == 0 {
            Err(ClientError::UpdateIntervalRejected)
        } else {
            Ok(Duration::from_secs(seconds))
        }
    }

    async fn update_interval_rpc(&self, new_update_interval: u64) -> Result<u64, ClientError> {
        let response: messages::UpdateIntervalResponse = self
            .rpc(
                MessageType::UpdateIntervalRequest,
                &messages::UpdateIntervalRequest {
                    new_update_interval,
                },
                MessageType::UpdateIntervalResponse,
            )
            .await?;
        Ok(response.update_interval)
    }

    async fn rpc<Request, Response>(
        &self,
        request_type: MessageType,
        request: &Request,
        response_type: MessageType,
    ) -> Result<Response, ClientError>
    where
        Request: prost::Message,
        Response: prost::Message + Default,
    {
        let (reply, reply_received) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock().unwrap();
            if pending.contains_key(&response_type.wire()) {
                return Err(ClientError::RequestInFlight);
            }
            pending.insert(response_type.wire(), reply);
        }

        if let Err(error) = self
            .shared
            .outbound
            .send(wire::wrap_message(request_type, request))
        {
            self.shared.pending.lock().unwrap().remove(&response_type.wire());
            return Err(error.into());
        }

        match timeout(RPC_TIMEOUT, reply_received).await {
            Ok(Ok(body)) => Ok(decode_body(&body)?),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed.into()),
            Err(_) => {
                // a late reply is discarded by the read loop
                self.shared.pending.lock().unwrap().remove(&response_type.wire());
                Err(ClientError::Timeout("rpc reply"))
            }
        }
    }
}

async fn find_invigilator(min: u16, max: u16) -> Result<(Connection, u16), ClientError> {
    for port in min..=max {
        if let Ok(conn) = Connection::connect(port).await {
            return Ok((conn, port));
        }
    }
    Err(ClientError::InvigilatorNotFound { min, max })
}

async fn expect_response<M: prost::Message + Default>(
    conn: &mut Connection,
    expected: MessageType,
) -> Result<M, ClientError> {
    while let Some(frame) = conn.recv().await {
        let frame = frame?;
        let (message_type, body) = wire::unwrap_message(&frame)?;
        if message_type == expected {
            return Ok(decode_body(&body)?);
        }
        debug!(?message_type, "skipping message while awaiting {expected:?}");
    }
    Err(TransportError::ConnectionClosed.into())
}

async fn read_loop(mut conn: Connection, shared: Arc<Shared>) {
    while let Some(frame) = conn.recv().await {
        let Ok(frame) = frame else { break };
        let Ok((message_type, body)) = wire::unwrap_message(&frame) else {
            warn!("malformed frame from the invigilator");
            continue;
        };
        match message_type {
            MessageType::VaultJoinConfirmation => handle_join_confirmation(&shared, &body),
            MessageType::NewVersionAvailable => handle_new_version(&shared, &body),
            other => {
                let waiter = shared.pending.lock().unwrap().remove(&other.wire());
                match waiter {
                    Some(reply) => {
                        let _ = reply.send(body);
                    }
                    None => debug!(?other, "discarding unsolicited message"),
                }
            }
        }
    }
    debug!("invigilator connection closed");
}

fn handle_join_confirmation(shared: &Arc<Shared>, body: &Bytes) {
    let ack = match decode_body::<messages::VaultJoinConfirmation>(body) {
        Ok(confirmation) => {
            let waiter = shared.joining.lock().unwrap().remove(&confirmation.identity);
            match waiter {
                Some(confirmed) => {
                    let _ = confirmed.send(confirmation.joined);
                    true
                }
                None => {
                    warn!(
                        identity = confirmation.identity,
                        "join confirmation for a vault nobody is waiting on"
                    );
                    false
                }
            }
        }
        Err(error) => {
            warn!(%error, "malformed join confirmation");
            false
        }
    };
    let _ = shared.outbound.send(wire::wrap_message(
        MessageType::VaultJoinConfirmationAck,
        &messages::VaultJoinConfirmationAck { ack },
    ));
}

fn handle_new_version(shared: &Arc<Shared>, body: &Bytes) {
    let filepath = match decode_body::<messages::NewVersionAvailable>(body) {
        Ok(announcement) => {
            let path = announcement.new_version_filepath;
            if std::path::Path::new(&path).exists() {
                Some(path)
            } else {
                warn!(path, "announced release file is missing");
                None
            }
        }
        Err(error) => {
            warn!(%error, "malformed new-version announcement");
            None
        }
    };

    let _ = shared.outbound.send(wire::wrap_message(
        MessageType::NewVersionAvailableAck,
        &messages::NewVersionAvailableAck {
            new_version_filepath: filepath.clone().unwrap_or_default(),
        },
    ));

    if let Some(path) = filepath {
        let callback = shared.on_new_version.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(&path);
        }
    }
}
