//! Client registration and challenge validation against a live daemon.

use std::time::Duration;

use bytes::Bytes;
use vigil_client::{ClientController, ClientError};
use vigil_core::config::{BootstrapEndpoint, InvigilatorConfig};
use vigil_core::crypto::VaultKeys;
use vigil_core::transport::Connection;
use vigil_core::wire::{self, decode_body, messages, MessageType};

fn test_config(min_port: u16, max_port: u16) -> InvigilatorConfig {
    InvigilatorConfig {
        min_port,
        max_port,
        challenge_timeout: Duration::from_millis(200),
        vault_program: "/nonexistent/vigil-vault".into(),
        bootstrap_endpoints: vec![
            BootstrapEndpoint {
                ip: "2001:db8::10".into(),
                port: 5483,
            },
            BootstrapEndpoint {
                ip: "2001:db8::11".into(),
                port: 5484,
            },
        ],
        ..Default::default()
    }
}

fn register_raw(conn: &Connection, keys: &VaultKeys) {
    conn.send(wire::wrap_message(
        MessageType::ClientRegistrationRequest,
        &messages::ClientRegistrationRequest {
            public_key_name: keys.identity(),
            public_key: keys.public_key_bytes().to_vec(),
        },
    ))
    .unwrap();
}

async fn recv_envelope(conn: &mut Connection) -> Option<(MessageType, Bytes)> {
    let frame = conn.recv().await?.ok()?;
    wire::unwrap_message(&frame).ok()
}

#[tokio::test(flavor = "multi_thread")]
async fn challenge_and_validation_succeed() {
    let state = vigil_daemon::start(test_config(46100, 46109)).await.unwrap();
    let client = ClientController::connect_to_range(VaultKeys::generate(), 46100, 46109)
        .await
        .unwrap();

    assert_eq!(client.invigilator_port(), state.port);
    assert_eq!(client.bootstrap_endpoints().len(), 2);
    assert_eq!(client.bootstrap_endpoints()[0].ip, "2001:db8::10");
    assert_eq!(client.bootstrap_endpoints()[1].port, 5484);
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_signature_is_refused_and_the_connection_dropped() {
    let state = vigil_daemon::start(test_config(46110, 46119)).await.unwrap();
    let keys = VaultKeys::generate();
    let mut conn = Connection::connect(state.port).await.unwrap();

    register_raw(&conn, &keys);
    let (message_type, _body) = recv_envelope(&mut conn).await.unwrap();
    assert_eq!(message_type, MessageType::ClientRegistrationResponse);

    // sign something that is not the challenge
    conn.send(wire::wrap_message(
        MessageType::ClientValidationRequest,
        &messages::ClientValidationRequest {
            signature: keys.sign(b"not the challenge"),
        },
    ))
    .unwrap();

    let (message_type, body) = recv_envelope(&mut conn).await.unwrap();
    assert_eq!(message_type, MessageType::ClientValidationResponse);
    let response: messages::ClientValidationResponse = decode_body(&body).unwrap();
    assert!(!response.result);

    // the daemon closes the connection after the refusal
    assert!(conn.recv().await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_challenges_leave_no_connection_behind() {
    let state = vigil_daemon::start(test_config(46120, 46129)).await.unwrap();
    let keys = VaultKeys::generate();
    let mut conn = Connection::connect(state.port).await.unwrap();

    register_raw(&conn, &keys);
    let (message_type, body) = recv_envelope(&mut conn).await.unwrap();
    assert_eq!(message_type, MessageType::ClientRegistrationResponse);
    let challenge: messages::ClientRegistrationResponse = decode_body(&body).unwrap();

    // sit on the challenge past the timeout
    tokio::time::sleep(Duration::from_millis(500)).await;

    // a late validation is met with "connection not found" and a close
    conn.send(wire::wrap_message(
        MessageType::ClientValidationRequest,
        &messages::ClientValidationRequest {
            signature: keys.sign(&challenge.challenge),
        },
    ))
    .unwrap();

    let (message_type, body) = recv_envelope(&mut conn).await.unwrap();
    assert_eq!(message_type, MessageType::ClientValidationResponse);
    let response: messages::ClientValidationResponse = decode_body(&body).unwrap();
    assert!(!response.result);
    assert!(conn.recv().await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn unvalidated_clients_cannot_start_vaults() {
    let state = vigil_daemon::start(test_config(46130, 46139)).await.unwrap();
    let keys = VaultKeys::generate();
    let mut conn = Connection::connect(state.port).await.unwrap();

    register_raw(&conn, &keys);
    let _challenge = recv_envelope(&mut conn).await.unwrap();

    // skipping validation: the request closes the connection
    conn.send(wire::wrap_message(
        MessageType::StartVaultRequest,
        &messages::StartVaultRequest::default(),
    ))
    .unwrap();
    assert!(conn.recv().await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn update_interval_round_trips() {
    let _state = vigil_daemon::start(test_config(46140, 46149)).await.unwrap();
    let client = ClientController::connect_to_range(VaultKeys::generate(), 46140, 46149)
        .await
        .unwrap();

    // default interval is one hour
    assert_eq!(
        client.get_update_interval().await.unwrap(),
        Duration::from_secs(60 * 60)
    );

    client
        .set_update_interval(Duration::from_secs(2 * 60 * 60))
        .await
        .unwrap();
    assert_eq!(
        client.get_update_interval().await.unwrap(),
        Duration::from_secs(2 * 60 * 60)
    );

    // below the permitted minimum: rejected before touching the wire
    assert!(matches!(
        client.set_update_interval(Duration::from_secs(10)).await,
        Err(ClientError::UpdateIntervalOutOfRange(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn start_vault_reports_spawn_failure() {
    let _state = vigil_daemon::start(test_config(46150, 46159)).await.unwrap();
    let client = ClientController::connect_to_range(VaultKeys::generate(), 46150, 46159)
        .await
        .unwrap();

    let result = client.start_vault(&VaultKeys::generate(), "account").await;
    assert!(matches!(result, Err(ClientError::StartVaultRefused)));
}
