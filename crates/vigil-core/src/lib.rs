//! # vigil-core
//!
//! Core library for vigil, a peer-to-peer vault supervision platform.
//!
//! This crate provides the building blocks shared by the Invigilator daemon,
//! the vault worker and the client controller:
//!
//! - **Chunk stores**: content-addressed storage with reference counting,
//!   optional capacity limits, and a buffered variant that layers a bounded
//!   FIFO cache over a durable file-backed store
//! - **Wire protocol**: length-prefixed loopback TCP framing and the
//!   protobuf message vocabulary of the control plane
//! - **Crypto glue**: Ed25519 vault identities and the challenge/signature
//!   exchange that binds a TCP connection to a public identity
//! - **Supervision policy**: exponential restart backoff for vault workers
//!
//! ## Example
//!
//! ```rust,no_run
//! use vigil_core::chunk_store::{
//!     BufferedChunkStore, ChunkId, ChunkStore, FileChunkStore, WriteExecutor,
//! };
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let permanent = FileChunkStore::open("/var/lib/vigil/chunks")?;
//! let store = BufferedChunkStore::new(permanent, WriteExecutor::default());
//! store.set_cache_capacity(64 << 20);
//!
//! let content = bytes::Bytes::from_static(b"chunk payload");
//! let id = ChunkId::hash_of(&content);
//! store.store(&id, content)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod chunk_store;
pub mod config;
pub mod crypto;
pub mod restart;
pub mod transport;
pub mod wire;

pub use chunk_store::{BufferedChunkStore, ChunkId, ChunkStore, FileChunkStore, MemoryChunkStore};
pub use config::{InvigilatorConfig, VaultConfig};
pub use crypto::VaultKeys;
pub use restart::RestartPolicy;
