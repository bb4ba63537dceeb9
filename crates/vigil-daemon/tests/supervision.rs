//! Worker-exit supervision: backoff restarts, give-up and owner
//! notification, driven end to end with a worker program that crashes on
//! every spawn.

use std::time::Duration;

use vigil_client::{ClientController, ClientError};
use vigil_core::config::InvigilatorConfig;
use vigil_core::crypto::VaultKeys;
use vigil_core::restart::RestartPolicy;

fn crashing_config(min_port: u16, max_port: u16) -> InvigilatorConfig {
    InvigilatorConfig {
        min_port,
        max_port,
        // `false` accepts the identifier argument and exits 1 immediately,
        // so every spawn counts as an unexpected exit
        vault_program: "false".into(),
        restart: RestartPolicy {
            max_restarts: 2,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
        },
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_restart_budget_fails_the_start_and_notifies_the_owner() {
    let state = vigil_daemon::start(crashing_config(46160, 46169)).await.unwrap();
    let client = ClientController::connect_to_range(VaultKeys::generate(), 46160, 46169)
        .await
        .unwrap();

    // the spawn itself succeeds, so the start request is accepted; the
    // worker then crashes through its whole restart budget without ever
    // joining, and the give-up notification releases the waiting client
    let vault_keys = VaultKeys::generate();
    let result = client.start_vault(&vault_keys, "account").await;
    assert!(matches!(result, Err(ClientError::VaultJoinFailed)));

    for _ in 0..50 {
        if state.vaults.vault_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(state.vaults.vault_count(), 0);
    assert!(state
        .vaults
        .find_by_identity(&vault_keys.identity())
        .is_none());
}
