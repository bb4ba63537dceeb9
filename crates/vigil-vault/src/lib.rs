//! vigil-vault — the vault worker side of the control plane.
//!
//! The [`VaultController`] is linked into every worker process. It connects
//! back to the Invigilator named on the command line, collects the vault's
//! cryptographic identity, reports the join outcome, and answers shutdown
//! requests on a local listener. The [`VaultService`] applies per-chunk
//! policy over the worker's buffered chunk store.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod controller;
pub mod service;

pub use controller::{parse_identifier, VaultController, VaultControllerError};
pub use service::VaultService;
