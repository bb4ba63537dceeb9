//! Vault keypairs and their serialized form.

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use zeroize::Zeroizing;

use super::CryptoError;

/// Length of a serialized secret key in bytes.
pub const SECRET_KEY_SIZE: usize = 32;

/// Length of a serialized public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// An Ed25519 keypair identifying a vault or a client.
///
/// The hex-encoded verifying key is the identity handle used throughout the
/// control plane; the secret half never leaves this type except through
/// [`VaultKeys::to_bytes`], which hands it out in a zeroizing container.
#[derive(Clone)]
pub struct VaultKeys {
    signing: SigningKey,
}

impl VaultKeys {
    /// Generates a fresh keypair.
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            signing: SigningKey::generate(&mut rng),
        }
    }

    /// Reconstructs a keypair from its serialized secret key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] when `bytes` is not exactly
    /// [`SECRET_KEY_SIZE`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret: [u8; SECRET_KEY_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self {
            signing: SigningKey::from_bytes(&secret),
        })
    }

    /// Returns the hex-encoded verifying key, the identity handle.
    #[must_use]
    pub fn identity(&self) -> String {
        hex::encode(self.public_key_bytes())
    }

    /// Returns the verifying key.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Returns the raw public key bytes.
    #[must_use]
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.signing.verifying_key().to_bytes()
    }

    /// Signs `message`, returning the detached signature bytes.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }

    /// Returns the serialized secret key in a zeroizing container.
    #[must_use]
    pub fn to_bytes(&self) -> Zeroizing<[u8; SECRET_KEY_SIZE]> {
        Zeroizing::new(self.signing.to_bytes())
    }
}

impl std::fmt::Debug for VaultKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultKeys")
            .field("identity", &self.identity())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_keys_round_trip() {
        let keys = VaultKeys::generate();
        let restored = VaultKeys::from_bytes(&*keys.to_bytes()).unwrap();
        assert_eq!(keys.identity(), restored.identity());
        assert_eq!(keys.public_key_bytes(), restored.public_key_bytes());
    }

    #[test]
    fn short_key_material_is_rejected() {
        assert!(matches!(
            VaultKeys::from_bytes(&[1, 2, 3]),
            Err(CryptoError::InvalidKey)
        ));
    }

    #[test]
    fn identity_is_hex_of_public_key() {
        let keys = VaultKeys::generate();
        assert_eq!(keys.identity(), hex::encode(keys.public_key_bytes()));
        assert_eq!(keys.identity().len(), 2 * PUBLIC_KEY_SIZE);
    }

    #[test]
    fn debug_output_does_not_leak_the_secret() {
        let keys = VaultKeys::generate();
        let rendered = format!("{keys:?}");
        assert!(rendered.contains(&keys.identity()));
        assert!(!rendered.contains(&hex::encode(&*keys.to_bytes())));
    }
}
