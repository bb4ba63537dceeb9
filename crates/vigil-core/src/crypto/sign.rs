//! Challenge generation and signature verification.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand::RngCore;

use super::{CryptoError, PUBLIC_KEY_SIZE};

/// Length of a detached signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Length of a connection challenge in bytes.
pub const CHALLENGE_SIZE: usize = 32;

/// Generates a fresh random challenge for a new client connection.
#[must_use]
pub fn random_challenge() -> Vec<u8> {
    let mut challenge = vec![0_u8; CHALLENGE_SIZE];
    rand::thread_rng().fill_bytes(&mut challenge);
    challenge
}

/// Parses raw public key bytes into a verifying key.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidKey`] when the bytes are the wrong length
/// or do not decode to a valid curve point.
pub fn parse_verifying_key(public_key: &[u8]) -> Result<VerifyingKey, CryptoError> {
    let bytes: [u8; PUBLIC_KEY_SIZE] =
        public_key.try_into().map_err(|_| CryptoError::InvalidKey)?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| CryptoError::InvalidKey)
}

/// Verifies a detached signature over `message` against `public_key`.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidKey`] for malformed key material and
/// [`CryptoError::InvalidSignature`] when verification fails.
pub fn verify_signature(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let key = parse_verifying_key(public_key)?;
    let signature =
        Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
    key.verify(message, &signature)
        .map_err(|_| CryptoError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::super::VaultKeys;
    use super::*;

    #[test]
    fn valid_signatures_verify() {
        let keys = VaultKeys::generate();
        let challenge = random_challenge();
        let signature = keys.sign(&challenge);
        verify_signature(&keys.public_key_bytes(), &challenge, &signature).unwrap();
    }

    #[test]
    fn signature_from_wrong_key_is_rejected() {
        let keys = VaultKeys::generate();
        let other = VaultKeys::generate();
        let challenge = random_challenge();
        let signature = other.sign(&challenge);
        assert_eq!(
            verify_signature(&keys.public_key_bytes(), &challenge, &signature),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn signature_over_different_message_is_rejected() {
        let keys = VaultKeys::generate();
        let signature = keys.sign(b"one challenge");
        assert_eq!(
            verify_signature(&keys.public_key_bytes(), b"another challenge", &signature),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        let keys = VaultKeys::generate();
        assert_eq!(
            verify_signature(&[0_u8; 7], b"msg", &keys.sign(b"msg")),
            Err(CryptoError::InvalidKey)
        );
        assert_eq!(
            verify_signature(&keys.public_key_bytes(), b"msg", &[0_u8; 3]),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn challenges_are_unique() {
        assert_ne!(random_challenge(), random_challenge());
    }
}
