//! Vault records and worker supervision.
//!
//! A [`VaultRecord`] is created when a start request is accepted and lives
//! until a requested shutdown completes or the restart budget is exhausted.
//! Workers are correlated with their record through a monotonically
//! increasing process index passed on the command line.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use vigil_core::config::InvigilatorConfig;
use vigil_core::crypto::VaultKeys;
use vigil_core::restart::RestartTracker;
use vigil_core::wire::{self, messages, MessageType};

use crate::client_connections::ConnectionId;
use crate::error::DaemonError;
use crate::server::ConnectionRegistry;

/// Supervision state of one vault.
pub struct VaultRecord {
    /// Index assigned at spawn time; the worker echoes it back when asking
    /// for its identity.
    pub process_index: u32,

    /// Account the vault belongs to.
    pub account_name: String,

    /// The vault's keys, delivered to the worker during the identity
    /// handshake.
    pub keys: VaultKeys,

    /// Connection of the client that started the vault.
    pub owner: ConnectionId,

    /// Port the worker listens on, learned from its identity request.
    pub listening_port: Option<u16>,

    /// Whether the worker has reported joining the network.
    pub join_confirmed: bool,

    /// Set once a stop request is being served; suppresses restarts.
    pub shutdown_requested: bool,

    restarts: RestartTracker,
    kill: Option<oneshot::Sender<()>>,
}

/// Spawns vault workers and supervises their lifetime.
pub struct VaultSupervisor {
    config: Arc<InvigilatorConfig>,
    listen_port: u16,
    registry: ConnectionRegistry,
    next_index: AtomicU32,
    vaults: Mutex<HashMap<u32, VaultRecord>>,
}

impl VaultSupervisor {
    /// Creates a supervisor for workers pointed back at `listen_port`.
    #[must_use]
    pub fn new(
        config: Arc<InvigilatorConfig>,
        listen_port: u16,
        registry: ConnectionRegistry,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            listen_port,
            registry,
            next_index: AtomicU32::new(0),
            vaults: Mutex::new(HashMap::new()),
        })
    }

    /// Allocates a process index, records the pending vault and spawns its
    /// worker.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::SpawnFailed`] when the worker program cannot
    /// be started.
    pub fn start_vault(
        self: &Arc<Self>,
        keys: VaultKeys,
        account_name: String,
        owner: ConnectionId,
    ) -> Result<u32, DaemonError> {
        let process_index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let child = self.spawn_worker(process_index)?;

        let (kill, kill_signal) = oneshot::channel();
        let record = VaultRecord {
            process_index,
            account_name,
            keys,
            owner,
            listening_port: None,
            join_confirmed: false,
            shutdown_requested: false,
            restarts: RestartTracker::new(self.config.restart.clone()),
            kill: Some(kill),
        };
        self.vaults.lock().unwrap().insert(process_index, record);
        self.monitor(process_index, child, kill_signal);
        info!(process_index, "vault worker started");
        Ok(process_index)
    }

    /// Stores the worker's listening port and returns what it needs for its
    /// identity: the keys and the account name.
    #[must_use]
    pub fn record_identity(
        &self,
        process_index: u32,
        listening_port: u16,
    ) -> Option<(VaultKeys, String)> {
        let mut vaults = self.vaults.lock().unwrap();
        let record = vaults.get_mut(&process_index)?;
        record.listening_port = Some(listening_port);
        Some((record.keys.clone(), record.account_name.clone()))
    }

    /// Marks the vault's join outcome and returns its owner's connection.
    /// A confirmed join also resets the restart budget.
    #[must_use]
    pub fn confirm_join(&self, identity: &str, joined: bool) -> Option<ConnectionId> {
        let mut vaults = self.vaults.lock().unwrap();
        let record = vaults
            .values_mut()
            .find(|record| record.keys.identity() == identity)?;
        record.join_confirmed = joined;
        if joined {
            record.restarts.reset();
        }
        Some(record.owner)
    }

    /// Looks a vault up by identity, returning its process index, public
    /// key bytes and listening port.
    #[must_use]
    pub fn find_by_identity(&self, identity: &str) -> Option<(u32, Vec<u8>, Option<u16>)> {
        let vaults = self.vaults.lock().unwrap();
        vaults
            .values()
            .find(|record| record.keys.identity() == identity)
            .map(|record| {
                (
                    record.process_index,
                    record.keys.public_key_bytes().to_vec(),
                    record.listening_port,
                )
            })
    }

    /// Suppresses restarts for a vault about to be stopped.
    pub fn request_shutdown(&self, process_index: u32) {
        if let Some(record) = self.vaults.lock().unwrap().get_mut(&process_index) {
            record.shutdown_requested = true;
        }
    }

    /// Terminates the worker without waiting for a graceful exit.
    pub fn force_kill(&self, process_index: u32) {
        let kill = {
            let mut vaults = self.vaults.lock().unwrap();
            vaults
                .get_mut(&process_index)
                .and_then(|record| record.kill.take())
        };
        if let Some(kill) = kill {
            let _ = kill.send(());
        }
    }

    /// Number of supervised vaults.
    #[must_use]
    pub fn vault_count(&self) -> usize {
        self.vaults.lock().unwrap().len()
    }

    fn spawn_worker(&self, process_index: u32) -> Result<Child, DaemonError> {
        let mut command = Command::new(&self.config.vault_program);
        command
            .arg("--invigilator_identifier")
            .arg(format!("{}:{process_index}", self.listen_port))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);
        command
            .spawn()
            .map_err(|error| DaemonError::SpawnFailed(error.to_string()))
    }

    fn monitor(self: &Arc<Self>, process_index: u32, mut child: Child, kill: oneshot::Receiver<()>) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                killed = kill => {
                    if killed.is_ok() {
                        let _ = child.start_kill();
                    }
                    child.wait().await
                }
            };
            let exit_code = status.ok().and_then(|status| status.code());
            supervisor.handle_exit(process_index, exit_code).await;
        });
    }

    async fn handle_exit(self: Arc<Self>, process_index: u32, exit_code: Option<i32>) {
        enum Action {
            Forget,
            Restart(std::time::Duration),
            GiveUp {
                owner: ConnectionId,
                identity: String,
            },
        }

        let action = {
            let mut vaults = self.vaults.lock().unwrap();
            let Some(record) = vaults.get_mut(&process_index) else {
                return;
            };
            if record.shutdown_requested {
                info!(process_index, ?exit_code, "vault worker stopped");
                vaults.remove(&process_index);
                Action::Forget
            } else if record.restarts.should_restart() {
                warn!(
                    process_index,
                    ?exit_code,
                    attempt = record.restarts.attempts() + 1,
                    "vault worker exited unexpectedly; scheduling restart"
                );
                Action::Restart(record.restarts.next_delay())
            } else {
                let owner = record.owner;
                let identity = record.keys.identity();
                error!(
                    process_index,
                    ?exit_code,
                    "vault worker exceeded its restart budget"
                );
                vaults.remove(&process_index);
                Action::GiveUp { owner, identity }
            }
        };

        match action {
            Action::Forget => {}
            Action::Restart(delay) => {
                tokio::time::sleep(delay).await;
                self.respawn(process_index);
            }
            Action::GiveUp { owner, identity } => self.notify_failed(owner, &identity),
        }
    }

    fn respawn(self: &Arc<Self>, process_index: u32) {
        // a stop request may have arrived during the backoff sleep
        {
            let mut vaults = self.vaults.lock().unwrap();
            match vaults.get_mut(&process_index) {
                Some(record) if record.shutdown_requested => {
                    info!(process_index, "restart cancelled by shutdown request");
                    vaults.remove(&process_index);
                    return;
                }
                Some(_) => {}
                None => return,
            }
        }
        match self.spawn_worker(process_index) {
            Ok(mut child) => {
                let (kill, kill_signal) = oneshot::channel();
                {
                    let mut vaults = self.vaults.lock().unwrap();
                    let Some(record) = vaults.get_mut(&process_index) else {
                        let _ = child.start_kill();
                        return;
                    };
                    if record.shutdown_requested {
                        let _ = child.start_kill();
                        vaults.remove(&process_index);
                        return;
                    }
                    record.kill = Some(kill);
                    record.join_confirmed = false;
                    record.listening_port = None;
                }
                self.monitor(process_index, child, kill_signal);
                info!(process_index, "vault worker restarted");
            }
            Err(error) => {
                warn!(process_index, %error, "vault worker restart failed");
                let removed = self.vaults.lock().unwrap().remove(&process_index);
                if let Some(record) = removed {
                    self.notify_failed(record.owner, &record.keys.identity());
                }
            }
        }
    }

    fn notify_failed(&self, owner: ConnectionId, identity: &str) {
        let frame = wire::wrap_message(
            MessageType::VaultJoinConfirmation,
            &messages::VaultJoinConfirmation {
                identity: identity.to_string(),
                joined: false,
            },
        );
        if !self.registry.send_to(owner, frame) {
            warn!(owner, identity, "owning client connection is gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use vigil_core::restart::RestartPolicy;

    use super::*;

    fn supervisor(program: &str) -> Arc<VaultSupervisor> {
        let config = InvigilatorConfig {
            vault_program: program.into(),
            ..Default::default()
        };
        VaultSupervisor::new(Arc::new(config), 5483, ConnectionRegistry::default())
    }

    /// `false` exits 1 immediately, so every spawn counts as a crash.
    fn crashing_supervisor(restart: RestartPolicy) -> Arc<VaultSupervisor> {
        let config = InvigilatorConfig {
            vault_program: "false".into(),
            restart,
            ..Default::default()
        };
        VaultSupervisor::new(Arc::new(config), 5483, ConnectionRegistry::default())
    }

    #[tokio::test]
    async fn process_indexes_increase_monotonically() {
        // `sleep` accepts the identifier argument and exits quietly later
        let supervisor = supervisor("sleep");
        let a = supervisor
            .start_vault(VaultKeys::generate(), "account-a".into(), 1)
            .unwrap();
        let b = supervisor
            .start_vault(VaultKeys::generate(), "account-b".into(), 1)
            .unwrap();
        assert_eq!(b, a + 1);
        assert_eq!(supervisor.vault_count(), 2);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let supervisor = supervisor("/nonexistent/vigil-vault-worker");
        let result = supervisor.start_vault(VaultKeys::generate(), "account".into(), 1);
        assert!(matches!(result, Err(DaemonError::SpawnFailed(_))));
        assert_eq!(supervisor.vault_count(), 0);
    }

    #[tokio::test]
    async fn identity_request_records_the_listening_port() {
        let supervisor = supervisor("sleep");
        let keys = VaultKeys::generate();
        let index = supervisor
            .start_vault(keys.clone(), "account".into(), 7)
            .unwrap();

        let (delivered, account_name) = supervisor.record_identity(index, 40_001).unwrap();
        assert_eq!(delivered.identity(), keys.identity());
        assert_eq!(account_name, "account");
        assert_eq!(
            supervisor.find_by_identity(&keys.identity()),
            Some((index, keys.public_key_bytes().to_vec(), Some(40_001)))
        );

        assert!(supervisor.record_identity(9999, 1).is_none());
    }

    #[tokio::test]
    async fn join_confirmation_finds_the_owner() {
        let supervisor = supervisor("sleep");
        let keys = VaultKeys::generate();
        supervisor
            .start_vault(keys.clone(), "account".into(), 42)
            .unwrap();

        assert_eq!(supervisor.confirm_join(&keys.identity(), true), Some(42));
        assert_eq!(supervisor.confirm_join("unknown-identity", true), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn crashing_worker_is_forgotten_once_the_budget_is_exhausted() {
        let supervisor = crashing_supervisor(RestartPolicy {
            max_restarts: 2,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(40),
            multiplier: 2.0,
        });
        supervisor
            .start_vault(VaultKeys::generate(), "account".into(), 1)
            .unwrap();
        assert_eq!(supervisor.vault_count(), 1);

        for _ in 0..50 {
            if supervisor.vault_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(supervisor.vault_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_during_backoff_cancels_the_restart() {
        let supervisor = crashing_supervisor(RestartPolicy {
            max_restarts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
        });
        let index = supervisor
            .start_vault(VaultKeys::generate(), "account".into(), 1)
            .unwrap();

        // let the worker crash and the restart enter its backoff sleep,
        // then ask for a shutdown before the respawn fires
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(supervisor.vault_count(), 1);
        supervisor.request_shutdown(index);

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(supervisor.vault_count(), 0);
    }
}
