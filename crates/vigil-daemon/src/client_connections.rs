//! Client connection registry.
//!
//! Each accepted client connection moves through two states: *unvalidated*,
//! holding the challenge it was issued and an expiry task, and *validated*,
//! holding the identity name of the key that signed the challenge. A
//! connection whose challenge expires is removed; its next request fails
//! with "connection not found" and the transport closes it.
//!
//! One mutex guards both maps; the expiry task re-acquires it to remove the
//! entry. Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::warn;

use vigil_core::crypto::verify_signature;

/// Daemon-local handle for one accepted TCP connection.
pub type ConnectionId = u64;

/// Errors raised by the connection registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionsError {
    /// The connection is in neither map.
    #[error("connection not found")]
    ConnectionNotFound,

    /// The connection exists but has not completed validation.
    #[error("client has not validated its connection")]
    UnvalidatedClient,

    /// The presented signature did not verify the stored challenge.
    #[error("invalid signature")]
    InvalidSignature,
}

struct UnvalidatedClient {
    name: String,
    public_key: Vec<u8>,
    challenge: Vec<u8>,
    expiry: AbortHandle,
}

#[derive(Default)]
struct Maps {
    unvalidated: HashMap<ConnectionId, UnvalidatedClient>,
    validated: HashMap<ConnectionId, String>,
}

/// Tracks client connections through the unvalidated → validated states.
#[derive(Clone)]
pub struct ClientConnections {
    inner: Arc<Mutex<Maps>>,
    challenge_timeout: Duration,
}

impl ClientConnections {
    /// Creates a registry whose challenges expire after `challenge_timeout`.
    #[must_use]
    pub fn new(challenge_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Maps::default())),
            challenge_timeout,
        }
    }

    /// Registers a connection as unvalidated and starts its expiry timer.
    pub fn add(
        &self,
        connection: ConnectionId,
        name: String,
        public_key: Vec<u8>,
        challenge: Vec<u8>,
    ) {
        let registry = Arc::clone(&self.inner);
        let timeout = self.challenge_timeout;
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut maps = registry.lock().unwrap();
            if maps.unvalidated.remove(&connection).is_some() {
                warn!(connection, "timed out waiting for client to validate");
            }
        })
        .abort_handle();

        let mut maps = self.inner.lock().unwrap();
        maps.unvalidated.insert(
            connection,
            UnvalidatedClient {
                name,
                public_key,
                challenge,
                expiry,
            },
        );
    }

    /// Verifies the signature over the stored challenge and promotes the
    /// connection, returning the identity name.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionsError::ConnectionNotFound`] for an unknown or
    /// expired connection and [`ConnectionsError::InvalidSignature`] when
    /// verification fails; either way the entry is removed.
    pub fn validate(
        &self,
        connection: ConnectionId,
        signature: &[u8],
    ) -> Result<String, ConnectionsError> {
        let mut maps = self.inner.lock().unwrap();
        let entry = maps
            .unvalidated
            .remove(&connection)
            .ok_or(ConnectionsError::ConnectionNotFound)?;
        entry.expiry.abort();
        if verify_signature(&entry.public_key, &entry.challenge, signature).is_err() {
            return Err(ConnectionsError::InvalidSignature);
        }
        maps.validated.insert(connection, entry.name.clone());
        Ok(entry.name)
    }

    /// Returns the identity of a validated connection.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionsError::UnvalidatedClient`] when the connection
    /// is still waiting on its challenge and
    /// [`ConnectionsError::ConnectionNotFound`] when it is in neither map.
    pub fn find_validated(&self, connection: ConnectionId) -> Result<String, ConnectionsError> {
        let maps = self.inner.lock().unwrap();
        if let Some(name) = maps.validated.get(&connection) {
            return Ok(name.clone());
        }
        if maps.unvalidated.contains_key(&connection) {
            Err(ConnectionsError::UnvalidatedClient)
        } else {
            Err(ConnectionsError::ConnectionNotFound)
        }
    }

    /// Removes a connection from whichever map holds it; idempotent.
    pub fn remove(&self, connection: ConnectionId) -> bool {
        let mut maps = self.inner.lock().unwrap();
        if let Some(entry) = maps.unvalidated.remove(&connection) {
            entry.expiry.abort();
            return true;
        }
        maps.validated.remove(&connection).is_some()
    }

    /// Connection ids of every validated client.
    #[must_use]
    pub fn validated_connections(&self) -> Vec<ConnectionId> {
        self.inner.lock().unwrap().validated.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use vigil_core::crypto::{random_challenge, VaultKeys};

    use super::*;

    fn registry() -> ClientConnections {
        ClientConnections::new(Duration::from_millis(100))
    }

    fn register(connections: &ClientConnections, connection: ConnectionId) -> (VaultKeys, Vec<u8>) {
        let keys = VaultKeys::generate();
        let challenge = random_challenge();
        connections.add(
            connection,
            keys.identity(),
            keys.public_key_bytes().to_vec(),
            challenge.clone(),
        );
        (keys, challenge)
    }

    #[tokio::test]
    async fn validation_promotes_the_connection() {
        let connections = registry();
        let (keys, challenge) = register(&connections, 1);

        assert_eq!(
            connections.find_validated(1),
            Err(ConnectionsError::UnvalidatedClient)
        );

        let name = connections.validate(1, &keys.sign(&challenge)).unwrap();
        assert_eq!(name, keys.identity());
        assert_eq!(connections.find_validated(1), Ok(keys.identity()));
        assert_eq!(connections.validated_connections(), vec![1]);
    }

    #[tokio::test]
    async fn bad_signatures_remove_the_entry() {
        let connections = registry();
        let (keys, _challenge) = register(&connections, 2);

        let wrong = keys.sign(b"not the challenge");
        assert_eq!(
            connections.validate(2, &wrong),
            Err(ConnectionsError::InvalidSignature)
        );
        assert_eq!(
            connections.find_validated(2),
            Err(ConnectionsError::ConnectionNotFound)
        );
    }

    #[tokio::test]
    async fn challenges_expire() {
        let connections = registry();
        let (keys, challenge) = register(&connections, 3);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            connections.find_validated(3),
            Err(ConnectionsError::ConnectionNotFound)
        );
        assert_eq!(
            connections.validate(3, &keys.sign(&challenge)),
            Err(ConnectionsError::ConnectionNotFound)
        );
    }

    #[tokio::test]
    async fn validation_cancels_the_expiry_timer() {
        let connections = registry();
        let (keys, challenge) = register(&connections, 4);
        connections.validate(4, &keys.sign(&challenge)).unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(connections.find_validated(4), Ok(keys.identity()));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let connections = registry();
        let (keys, challenge) = register(&connections, 5);
        connections.validate(5, &keys.sign(&challenge)).unwrap();

        assert!(connections.remove(5));
        assert!(!connections.remove(5));
        assert_eq!(
            connections.find_validated(5),
            Err(ConnectionsError::ConnectionNotFound)
        );

        let (_keys, _challenge) = register(&connections, 6);
        assert!(connections.remove(6));
    }
}
