//! In-memory chunk store.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;

use super::{
    clamped_capacity, fits, is_same_store, ChunkId, ChunkStore, ChunkStoreError,
};

struct Entry {
    content: Bytes,
    refs: u64,
}

#[derive(Default)]
struct Inner {
    chunks: HashMap<ChunkId, Entry>,
    size: u64,
    capacity: u64,
}

/// A chunk store backed by an in-memory map.
///
/// Reads take a shared lock and may proceed concurrently; mutations are
/// serialized by the store-wide lock.
#[derive(Default)]
pub struct MemoryChunkStore {
    inner: RwLock<Inner>,
}

impl MemoryChunkStore {
    /// Creates an unbounded store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store with the given capacity; 0 means unbounded.
    #[must_use]
    pub fn with_capacity(capacity: u64) -> Self {
        let store = Self::new();
        store.inner.write().unwrap().capacity = capacity;
        store
    }

    fn remove_reference(inner: &mut Inner, id: &ChunkId) {
        if let Some(entry) = inner.chunks.get_mut(id) {
            if entry.refs > 1 {
                entry.refs -= 1;
            } else {
                let len = entry.content.len() as u64;
                inner.chunks.remove(id);
                inner.size -= len;
            }
        }
    }
}

impl ChunkStore for MemoryChunkStore {
    fn store(&self, id: &ChunkId, content: Bytes) -> Result<(), ChunkStoreError> {
        if content.is_empty() {
            return Err(ChunkStoreError::InvalidArgument("empty chunk content"));
        }
        let mut inner = self.inner.write().unwrap();
        if let Some(entry) = inner.chunks.get_mut(id) {
            entry.refs += 1;
            return Ok(());
        }
        let len = content.len() as u64;
        if !fits(inner.size, len, inner.capacity) {
            return Err(ChunkStoreError::OutOfCapacity);
        }
        inner.chunks.insert(id.clone(), Entry { content, refs: 1 });
        inner.size += len;
        Ok(())
    }

    fn get(&self, id: &ChunkId) -> Option<Bytes> {
        let inner = self.inner.read().unwrap();
        inner.chunks.get(id).map(|entry| entry.content.clone())
    }

    fn has(&self, id: &ChunkId) -> bool {
        self.inner.read().unwrap().chunks.contains_key(id)
    }

    fn delete(&self, id: &ChunkId) -> Result<(), ChunkStoreError> {
        let mut inner = self.inner.write().unwrap();
        Self::remove_reference(&mut inner, id);
        Ok(())
    }

    fn modify(&self, id: &ChunkId, content: Bytes) -> Result<(), ChunkStoreError> {
        if content.is_empty() {
            return Err(ChunkStoreError::InvalidArgument("empty chunk content"));
        }
        let mut inner = self.inner.write().unwrap();
        let Some(entry) = inner.chunks.get(id) else {
            return Err(ChunkStoreError::NotFound);
        };
        if id.matches_content(&entry.content) {
            return if id.matches_content(&content) {
                Ok(())
            } else {
                Err(ChunkStoreError::Immutable)
            };
        }
        let old_len = entry.content.len() as u64;
        let new_len = content.len() as u64;
        let remaining = inner.size - old_len;
        if !fits(remaining, new_len, inner.capacity) {
            return Err(ChunkStoreError::OutOfCapacity);
        }
        inner.size = remaining + new_len;
        if let Some(entry) = inner.chunks.get_mut(id) {
            entry.content = content;
        }
        Ok(())
    }

    fn move_to(&self, id: &ChunkId, sink: &dyn ChunkStore) -> Result<(), ChunkStoreError> {
        if is_same_store(self, sink) {
            return Err(ChunkStoreError::InvalidArgument(
                "cannot move a chunk onto its own store",
            ));
        }
        let mut inner = self.inner.write().unwrap();
        let Some(entry) = inner.chunks.get(id) else {
            return Err(ChunkStoreError::NotFound);
        };
        let content = entry.content.clone();
        if !sink.has(id) && !sink.vacant(content.len() as u64) {
            return Err(ChunkStoreError::OutOfCapacity);
        }
        sink.store(id, content)?;
        Self::remove_reference(&mut inner, id);
        Ok(())
    }

    fn count(&self) -> u64 {
        let inner = self.inner.read().unwrap();
        inner.chunks.values().map(|entry| entry.refs).sum()
    }

    fn count_of(&self, id: &ChunkId) -> u64 {
        let inner = self.inner.read().unwrap();
        inner.chunks.get(id).map_or(0, |entry| entry.refs)
    }

    fn size(&self) -> u64 {
        self.inner.read().unwrap().size
    }

    fn size_of(&self, id: &ChunkId) -> u64 {
        let inner = self.inner.read().unwrap();
        inner
            .chunks
            .get(id)
            .map_or(0, |entry| entry.content.len() as u64)
    }

    fn capacity(&self) -> u64 {
        self.inner.read().unwrap().capacity
    }

    fn set_capacity(&self, capacity: u64) {
        let mut inner = self.inner.write().unwrap();
        inner.capacity = clamped_capacity(capacity, inner.size);
    }

    fn vacant(&self, required: u64) -> bool {
        let inner = self.inner.read().unwrap();
        fits(inner.size, required, inner.capacity)
    }

    fn empty(&self) -> bool {
        self.inner.read().unwrap().chunks.is_empty()
    }

    fn clear(&self) -> Result<(), ChunkStoreError> {
        let mut inner = self.inner.write().unwrap();
        inner.chunks.clear();
        inner.size = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(len: usize) -> Bytes {
        Bytes::from(vec![0x5a_u8; len])
    }

    fn mutable_id(seed: u8) -> ChunkId {
        ChunkId::new(vec![seed; 65]).unwrap()
    }

    #[test]
    fn store_and_get_round_trip() {
        let store = MemoryChunkStore::new();
        let payload = Bytes::from_static(b"payload");
        let id = ChunkId::hash_of(&payload);

        store.store(&id, payload.clone()).unwrap();
        assert_eq!(store.get(&id), Some(payload));
        assert!(store.has(&id));
        assert_eq!(store.count(), 1);
        assert_eq!(store.size(), 7);
        assert!(!store.empty());
    }

    #[test]
    fn empty_content_is_rejected() {
        let store = MemoryChunkStore::new();
        let id = mutable_id(1);
        assert!(matches!(
            store.store(&id, Bytes::new()),
            Err(ChunkStoreError::InvalidArgument(_))
        ));
        assert!(store.empty());
    }

    #[test]
    fn repeat_stores_bump_the_count_and_ignore_bytes() {
        let store = MemoryChunkStore::new();
        let payload = Bytes::from_static(b"first");
        let id = ChunkId::hash_of(&payload);

        store.store(&id, payload.clone()).unwrap();
        store.store(&id, Bytes::from_static(b"second, ignored")).unwrap();
        store.store(&id, payload.clone()).unwrap();

        assert_eq!(store.count(), 3);
        assert_eq!(store.count_of(&id), 3);
        assert_eq!(store.size(), payload.len() as u64);
        assert_eq!(store.get(&id), Some(payload));
    }

    #[test]
    fn delete_decrements_and_erases_at_zero() {
        let store = MemoryChunkStore::new();
        let id = mutable_id(2);
        store.store(&id, content(10)).unwrap();
        store.store(&id, content(10)).unwrap();

        store.delete(&id).unwrap();
        assert_eq!(store.count_of(&id), 1);
        assert!(store.has(&id));

        store.delete(&id).unwrap();
        assert!(!store.has(&id));
        assert_eq!(store.size(), 0);

        // absent id: still a success
        store.delete(&id).unwrap();
    }

    #[test]
    fn store_then_delete_leaves_the_store_unchanged() {
        let store = MemoryChunkStore::with_capacity(1000);
        let id = mutable_id(3);
        store.store(&id, content(10)).unwrap();
        store.delete(&id).unwrap();
        assert!(store.empty());
        assert_eq!(store.size(), 0);
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn capacity_refuses_new_chunks_but_not_reference_bumps() {
        let store = MemoryChunkStore::with_capacity(100);
        let id = mutable_id(4);
        store.store(&id, content(80)).unwrap();

        let big = mutable_id(5);
        assert!(matches!(
            store.store(&big, content(21)),
            Err(ChunkStoreError::OutOfCapacity)
        ));

        // bumping an existing reference needs no space
        store.store(&id, content(80)).unwrap();
        assert_eq!(store.count_of(&id), 2);

        assert!(store.vacant(20));
        assert!(!store.vacant(21));
    }

    #[test]
    fn set_capacity_clamps_to_current_size() {
        let store = MemoryChunkStore::new();
        let id = mutable_id(6);
        store.store(&id, content(50)).unwrap();

        store.set_capacity(10);
        assert_eq!(store.capacity(), 50);

        store.set_capacity(0);
        assert_eq!(store.capacity(), 0);
        assert!(store.vacant(u64::MAX / 2));
    }

    #[test]
    fn modify_on_hash_named_chunk_requires_matching_bytes() {
        let store = MemoryChunkStore::new();
        let original = Bytes::from_static(b"immutable bytes");
        let id = ChunkId::hash_of(&original);
        store.store(&id, original.clone()).unwrap();

        assert!(matches!(
            store.modify(&id, Bytes::from_static(b"replacement")),
            Err(ChunkStoreError::Immutable)
        ));
        assert_eq!(store.get(&id), Some(original.clone()));

        // same bytes hash back to the id: accepted, nothing changes
        store.modify(&id, original.clone()).unwrap();
        assert_eq!(store.count_of(&id), 1);
        assert_eq!(store.get(&id), Some(original));
    }

    #[test]
    fn modify_replaces_mutable_chunks_and_checks_the_delta() {
        let store = MemoryChunkStore::with_capacity(100);
        let id = mutable_id(7);
        store.store(&id, content(60)).unwrap();
        store.store(&id, content(60)).unwrap();

        store.modify(&id, content(90)).unwrap();
        assert_eq!(store.size(), 90);
        assert_eq!(store.count_of(&id), 2);

        assert!(matches!(
            store.modify(&id, content(101)),
            Err(ChunkStoreError::OutOfCapacity)
        ));
        assert_eq!(store.size(), 90);

        let absent = mutable_id(8);
        assert!(matches!(
            store.modify(&absent, content(1)),
            Err(ChunkStoreError::NotFound)
        ));
    }

    #[test]
    fn move_to_transfers_a_single_reference() {
        let source = MemoryChunkStore::new();
        let sink = MemoryChunkStore::new();
        let id = mutable_id(9);
        source.store(&id, content(100)).unwrap();

        source.move_to(&id, &sink).unwrap();
        assert!(!source.has(&id));
        assert!(source.empty());
        assert_eq!(sink.count_of(&id), 1);
        assert_eq!(sink.size(), 100);
    }

    #[test]
    fn move_to_respects_the_sink_capacity() {
        let source = MemoryChunkStore::new();
        let sink = MemoryChunkStore::with_capacity(10);
        let id = mutable_id(10);
        source.store(&id, content(100)).unwrap();

        assert!(matches!(
            source.move_to(&id, &sink),
            Err(ChunkStoreError::OutOfCapacity)
        ));
        assert_eq!(source.count_of(&id), 1);
        assert!(!sink.has(&id));

        // a sink that already holds the id only gains a reference
        let holder = MemoryChunkStore::with_capacity(100);
        holder.store(&id, content(100)).unwrap();
        source.move_to(&id, &holder).unwrap();
        assert_eq!(holder.count_of(&id), 2);
        assert!(!source.has(&id));
    }

    #[test]
    fn move_to_same_store_fails() {
        let store = MemoryChunkStore::new();
        let id = mutable_id(11);
        store.store(&id, content(10)).unwrap();
        assert!(matches!(
            store.move_to(&id, &store),
            Err(ChunkStoreError::InvalidArgument(_))
        ));
        assert_eq!(store.count_of(&id), 1);
    }

    #[test]
    fn clear_keeps_the_capacity() {
        let store = MemoryChunkStore::with_capacity(500);
        store.store(&mutable_id(12), content(100)).unwrap();
        store.clear().unwrap();
        assert!(store.empty());
        assert_eq!(store.size(), 0);
        assert_eq!(store.capacity(), 500);
    }
}
