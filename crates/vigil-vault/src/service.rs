//! Local chunk service of a vault worker.
//!
//! Wraps the worker's buffered chunk store with the per-chunk-type policy:
//! hash-named ids must match their content on the way in, and modification
//! or deletion is gated on the action authority. The store itself stays
//! value-neutral.

use std::sync::Arc;

use bytes::Bytes;

use vigil_core::chunk_store::{
    BufferedChunkStore, ChunkActionAuthority, ChunkId, ChunkStore, ChunkStoreError,
    FileChunkStore, WriteExecutor,
};
use vigil_core::config::VaultConfig;

/// Policy-checked chunk operations for one vault.
pub struct VaultService {
    store: BufferedChunkStore,
    authority: Arc<dyn ChunkActionAuthority>,
}

impl VaultService {
    /// Opens the vault's chunk store under the configured directory.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkStoreError::Io`] when the chunk directory cannot be
    /// prepared.
    pub fn new(
        config: &VaultConfig,
        executor: WriteExecutor,
        authority: Arc<dyn ChunkActionAuthority>,
    ) -> Result<Self, ChunkStoreError> {
        let permanent = FileChunkStore::with_depth(&config.chunk_dir, config.shard_depth)?;
        let store = BufferedChunkStore::new(permanent, executor);
        store.set_cache_capacity(config.cache_capacity);
        Ok(Self { store, authority })
    }

    /// Stores a chunk, enforcing content-hash integrity for hash-named ids.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkStoreError::InvalidArgument`] when a hash-named id
    /// does not match its content, plus the store's own errors.
    pub fn put_chunk(&self, id: &ChunkId, content: Bytes) -> Result<(), ChunkStoreError> {
        if self.authority.is_hash_named(id) && !id.matches_content(&content) {
            return Err(ChunkStoreError::InvalidArgument(
                "content does not match its hash-named id",
            ));
        }
        self.store.store(id, content)
    }

    /// Retrieves a chunk.
    #[must_use]
    pub fn get_chunk(&self, id: &ChunkId) -> Option<Bytes> {
        self.store.get(id)
    }

    /// Replaces a chunk's bytes on behalf of `actor`.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkStoreError::Immutable`] when the policy denies the
    /// modification, plus the store's own errors.
    pub fn modify_chunk(
        &self,
        id: &ChunkId,
        content: Bytes,
        actor: &str,
    ) -> Result<(), ChunkStoreError> {
        if !self.authority.may_modify(id, actor) {
            return Err(ChunkStoreError::Immutable);
        }
        self.store.modify(id, content)
    }

    /// Marks a chunk for deletion on behalf of `actor`.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkStoreError::InvalidArgument`] when the policy denies
    /// the deletion.
    pub fn delete_chunk(&self, id: &ChunkId, actor: &str) -> Result<(), ChunkStoreError> {
        if !self.authority.may_delete(id, actor) {
            return Err(ChunkStoreError::InvalidArgument(
                "deletion denied for this chunk type",
            ));
        }
        self.store.mark_for_deletion(id);
        Ok(())
    }

    /// Physically removes every chunk marked for deletion.
    ///
    /// # Errors
    ///
    /// Propagates the store's errors; unapplied marks are retained.
    pub fn reclaim(&self) -> Result<(), ChunkStoreError> {
        self.store.delete_all_marked()
    }

    /// The underlying buffered store.
    #[must_use]
    pub fn store(&self) -> &BufferedChunkStore {
        &self.store
    }
}
