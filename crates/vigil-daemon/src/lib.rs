//! vigil-daemon — the Invigilator.
//!
//! A long-lived supervisor that launches, monitors and restarts vault
//! worker processes, and serves clients over length-prefixed loopback TCP.
//! Clients authenticate with a challenge/signature exchange before any
//! privileged request is honored; freshly spawned workers connect back to
//! collect their cryptographic identity.
//!
//! # Modules
//!
//! - [`client_connections`]: unvalidated → validated connection registry
//! - [`vaults`]: vault records, spawning and restart supervision
//! - [`server`]: listener, accept loop and connection handling
//! - [`dispatch`]: request routing
//! - [`update`]: periodic new-version discovery and notification

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod client_connections;
pub mod dispatch;
pub mod error;
pub mod server;
pub mod update;
pub mod vaults;

pub use error::DaemonError;
pub use server::{start, Invigilator};
