//! Request routing.
//!
//! Each inbound envelope is routed by message type. Registration and
//! validation are open to any connection; vault control requests demand a
//! validated client; identity and join traffic comes from the workers
//! themselves. Handlers return the reply frame, or an error when the
//! connection should be closed.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use vigil_core::config::{MAX_UPDATE_INTERVAL, MIN_UPDATE_INTERVAL};
use vigil_core::crypto::{random_challenge, verify_signature, VaultKeys};
use vigil_core::transport::Connection;
use vigil_core::wire::{self, decode_body, messages, MessageType};

use crate::client_connections::ConnectionId;
use crate::error::DaemonError;
use crate::server::Invigilator;

/// Routes one request, returning the reply frame if any.
///
/// # Errors
///
/// An error means the connection is no longer trusted and must be closed.
pub async fn handle(
    state: &Arc<Invigilator>,
    connection: ConnectionId,
    conn: &Connection,
    message_type: MessageType,
    body: &[u8],
) -> Result<Option<Bytes>, DaemonError> {
    match message_type {
        MessageType::ClientRegistrationRequest => handle_registration(state, connection, body),
        MessageType::ClientValidationRequest => handle_validation(state, connection, conn, body),
        MessageType::StartVaultRequest => handle_start_vault(state, connection, body),
        MessageType::StopVaultRequest => handle_stop_vault(state, connection, body).await,
        MessageType::UpdateIntervalRequest => handle_update_interval(state, connection, body),
        MessageType::VaultIdentityRequest => handle_vault_identity(state, body),
        MessageType::VaultJoinedNetwork => handle_vault_joined(state, body),
        MessageType::VaultJoinConfirmationAck | MessageType::NewVersionAvailableAck => {
            debug!(connection, ?message_type, "acknowledgement received");
            Ok(None)
        }
        other => {
            warn!(connection, ?other, "unexpected message type");
            Ok(None)
        }
    }
}

fn handle_registration(
    state: &Arc<Invigilator>,
    connection: ConnectionId,
    body: &[u8],
) -> Result<Option<Bytes>, DaemonError> {
    let request: messages::ClientRegistrationRequest = decode_body(body)?;
    let challenge = random_challenge();
    state.connections.add(
        connection,
        request.public_key_name,
        request.public_key,
        challenge.clone(),
    );
    debug!(connection, "challenge issued");
    Ok(Some(wire::wrap_message(
        MessageType::ClientRegistrationResponse,
        &messages::ClientRegistrationResponse { challenge },
    )))
}

fn handle_validation(
    state: &Arc<Invigilator>,
    connection: ConnectionId,
    conn: &Connection,
    body: &[u8],
) -> Result<Option<Bytes>, DaemonError> {
    let request: messages::ClientValidationRequest = decode_body(body)?;
    match state.connections.validate(connection, &request.signature) {
        Ok(name) => {
            info!(connection, client = name, "client validated");
            let endpoints = &state.config.bootstrap_endpoints;
            Ok(Some(wire::wrap_message(
                MessageType::ClientValidationResponse,
                &messages::ClientValidationResponse {
                    result: true,
                    bootstrap_endpoint_ip: endpoints.iter().map(|e| e.ip.clone()).collect(),
                    bootstrap_endpoint_port: endpoints
                        .iter()
                        .map(|e| u32::from(e.port))
                        .collect(),
                },
            )))
        }
        Err(error) => {
            // report the refusal, then drop the connection
            let _ = conn.send(wire::wrap_message(
                MessageType::ClientValidationResponse,
                &messages::ClientValidationResponse::default(),
            ));
            Err(error.into())
        }
    }
}

fn handle_start_vault(
    state: &Arc<Invigilator>,
    connection: ConnectionId,
    body: &[u8],
) -> Result<Option<Bytes>, DaemonError> {
    state.connections.find_validated(connection)?;
    let request: messages::StartVaultRequest = decode_body(body)?;

    let started = start_vault(state, connection, &request);
    if let Err(error) = &started {
        warn!(connection, %error, "start vault request failed");
    }
    Ok(Some(wire::wrap_message(
        MessageType::StartVaultResponse,
        &messages::StartVaultResponse {
            result: started.is_ok(),
        },
    )))
}

fn start_vault(
    state: &Arc<Invigilator>,
    connection: ConnectionId,
    request: &messages::StartVaultRequest,
) -> Result<u32, DaemonError> {
    let keys = VaultKeys::from_bytes(&request.keys)?;
    verify_signature(
        &keys.public_key_bytes(),
        &request.token,
        &request.token_signature,
    )?;
    state
        .vaults
        .start_vault(keys, request.account_name.clone(), connection)
}

async fn handle_stop_vault(
    state: &Arc<Invigilator>,
    connection: ConnectionId,
    body: &[u8],
) -> Result<Option<Bytes>, DaemonError> {
    state.connections.find_validated(connection)?;
    let request: messages::StopVaultRequest = decode_body(body)?;

    let stopped = stop_vault(state, &request).await;
    if let Err(error) = &stopped {
        warn!(connection, identity = request.identity, %error, "stop vault request failed");
    }
    Ok(Some(wire::wrap_message(
        MessageType::StopVaultResponse,
        &messages::StopVaultResponse {
            result: stopped.is_ok(),
        },
    )))
}

async fn stop_vault(
    state: &Arc<Invigilator>,
    request: &messages::StopVaultRequest,
) -> Result<(), DaemonError> {
    let (process_index, public_key, listening_port) = state
        .vaults
        .find_by_identity(&request.identity)
        .ok_or_else(|| DaemonError::VaultNotFound(request.identity.clone()))?;
    verify_signature(&public_key, &request.data, &request.signature)?;
    state.vaults.request_shutdown(process_index);

    let Some(listening_port) = listening_port else {
        // the worker never completed its identity handshake
        state.vaults.force_kill(process_index);
        return Ok(());
    };

    let acknowledged = tokio::time::timeout(
        state.config.rpc_timeout,
        request_worker_shutdown(listening_port),
    )
    .await;
    match acknowledged {
        Ok(Ok(true)) => Ok(()),
        Ok(Ok(false) | Err(_)) | Err(_) => {
            warn!(process_index, "worker did not acknowledge shutdown; killing it");
            state.vaults.force_kill(process_index);
            Ok(())
        }
    }
}

async fn request_worker_shutdown(listening_port: u16) -> Result<bool, DaemonError> {
    let mut conn = Connection::connect(listening_port).await?;
    conn.send(wire::wrap_message(
        MessageType::VaultShutdownRequest,
        &messages::VaultShutdownRequest {},
    ))?;
    while let Some(frame) = conn.recv().await {
        let frame = frame?;
        if let Ok((MessageType::VaultShutdownResponse, body)) = wire::unwrap_message(&frame) {
            let response: messages::VaultShutdownResponse = decode_body(&body)?;
            return Ok(response.acknowledged);
        }
    }
    Ok(false)
}

fn handle_update_interval(
    state: &Arc<Invigilator>,
    connection: ConnectionId,
    body: &[u8],
) -> Result<Option<Bytes>, DaemonError> {
    state.connections.find_validated(connection)?;
    let request: messages::UpdateIntervalRequest = decode_body(body)?;

    let update_interval = if request.new_update_interval == 0 {
        state.update_interval.lock().unwrap().as_secs()
    } else {
        let requested = Duration::from_secs(request.new_update_interval);
        if requested < MIN_UPDATE_INTERVAL || requested > MAX_UPDATE_INTERVAL {
            warn!(connection, ?requested, "update interval out of range");
            0
        } else {
            *state.update_interval.lock().unwrap() = requested;
            info!(connection, ?requested, "update interval changed");
            request.new_update_interval
        }
    };
    Ok(Some(wire::wrap_message(
        MessageType::UpdateIntervalResponse,
        &messages::UpdateIntervalResponse { update_interval },
    )))
}

fn handle_vault_identity(
    state: &Arc<Invigilator>,
    body: &[u8],
) -> Result<Option<Bytes>, DaemonError> {
    let request: messages::VaultIdentityRequest = decode_body(body)?;
    #[allow(clippy::cast_possible_truncation)] // ports fit in u16
    let listening_port = request.listening_port as u16;

    let response = match state.vaults.record_identity(request.process_index, listening_port) {
        Some((keys, account_name)) => {
            info!(
                process_index = request.process_index,
                listening_port, "vault identity delivered"
            );
            let endpoints = &state.config.bootstrap_endpoints;
            messages::VaultIdentityResponse {
                result: true,
                account_name,
                keys: keys.to_bytes().to_vec(),
                bootstrap_endpoint_ip: endpoints.iter().map(|e| e.ip.clone()).collect(),
                bootstrap_endpoint_port: endpoints.iter().map(|e| u32::from(e.port)).collect(),
            }
        }
        None => {
            warn!(
                process_index = request.process_index,
                "identity request for unknown process index"
            );
            messages::VaultIdentityResponse::default()
        }
    };
    Ok(Some(wire::wrap_message(
        MessageType::VaultIdentityResponse,
        &response,
    )))
}

fn handle_vault_joined(
    state: &Arc<Invigilator>,
    body: &[u8],
) -> Result<Option<Bytes>, DaemonError> {
    let request: messages::VaultJoinedNetwork = decode_body(body)?;
    let ack = match state.vaults.confirm_join(&request.identity, request.joined) {
        Some(owner) => {
            info!(identity = request.identity, joined = request.joined, "vault reported in");
            let confirmation = wire::wrap_message(
                MessageType::VaultJoinConfirmation,
                &messages::VaultJoinConfirmation {
                    identity: request.identity.clone(),
                    joined: request.joined,
                },
            );
            if !state.registry.send_to(owner, confirmation) {
                warn!(owner, "owning client connection is gone");
            }
            true
        }
        None => {
            warn!(identity = request.identity, "join report for unknown vault");
            false
        }
    };
    Ok(Some(wire::wrap_message(
        MessageType::VaultJoinedNetworkAck,
        &messages::VaultJoinedNetworkAck { ack },
    )))
}
