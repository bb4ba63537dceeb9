//! Cryptographic glue for vault identities.
//!
//! This module provides the signing primitives the control plane relies on:
//!
//! - **Ed25519 keypairs**: every vault (and every client) is identified by a
//!   keypair; the hex-encoded verifying key doubles as the identity handle
//! - **Challenge signing**: the two-message exchange that binds a TCP
//!   connection to a public identity
//! - **Key serialization**: the compact form delivered to a freshly started
//!   vault during the identity handshake
//!
//! # Example
//!
//! ```rust
//! use vigil_core::crypto::{random_challenge, verify_signature, VaultKeys};
//!
//! let keys = VaultKeys::generate();
//! let challenge = random_challenge();
//! let signature = keys.sign(&challenge);
//! assert!(verify_signature(&keys.public_key_bytes(), &challenge, &signature).is_ok());
//! ```

mod keys;
mod sign;

pub use keys::{VaultKeys, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE};
pub use sign::{
    parse_verifying_key, random_challenge, verify_signature, CHALLENGE_SIZE, SIGNATURE_SIZE,
};

/// Errors raised by key parsing and signature verification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// Key material had the wrong length or was not a valid curve point.
    #[error("invalid key material")]
    InvalidKey,

    /// The signature did not verify against the message and key.
    #[error("invalid signature")]
    InvalidSignature,
}
