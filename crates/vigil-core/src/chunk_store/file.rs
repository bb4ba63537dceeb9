//! Durable chunk store with the reference count encoded in filenames.
//!
//! A chunk with id `X` and three references lives as `<shard>/<hex(X)>.3`
//! under the store root; reference count changes are plain renames, which
//! are crash-atomic on POSIX filesystems. Content writes go through a
//! temporary file followed by a rename. A restart recovers the summary
//! (count, total size) by scanning the directory tree.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use bytes::Bytes;
use tracing::warn;

use super::{
    clamped_capacity, fits, is_same_store, ChunkId, ChunkStore, ChunkStoreError,
};

/// Default number of single-hex-character sharding levels.
pub const DEFAULT_SHARD_DEPTH: usize = 3;

const TMP_EXTENSION: &str = "tmp";

struct Summary {
    count: u64,
    size: u64,
    capacity: u64,
}

struct Located {
    path: PathBuf,
    refs: u64,
    len: u64,
}

/// A chunk store whose bytes live as files under one root directory.
pub struct FileChunkStore {
    root: PathBuf,
    depth: usize,
    inner: RwLock<Summary>,
}

impl FileChunkStore {
    /// Opens (or creates) a store under `root` with the default shard depth,
    /// rebuilding the summary by directory scan.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkStoreError::Io`] when the tree cannot be created or
    /// scanned.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ChunkStoreError> {
        Self::with_depth(root, DEFAULT_SHARD_DEPTH)
    }

    /// Opens a store with an explicit number of sharding levels.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkStoreError::Io`] when the tree cannot be created or
    /// scanned.
    pub fn with_depth(root: impl Into<PathBuf>, depth: usize) -> Result<Self, ChunkStoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let (count, size) = scan_tree(&root)?;
        Ok(Self {
            root,
            depth,
            inner: RwLock::new(Summary {
                count,
                size,
                capacity: 0,
            }),
        })
    }

    /// The store's root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn shard_dir(&self, hex_id: &str) -> PathBuf {
        let mut dir = self.root.clone();
        for level in hex_id.chars().take(self.depth) {
            dir.push(level.to_string());
        }
        dir
    }

    fn locate(&self, id: &ChunkId) -> Result<Option<Located>, ChunkStoreError> {
        let hex_id = id.to_hex();
        let dir = self.shard_dir(&hex_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(refs) = parse_refs(name, &hex_id) else {
                continue;
            };
            return Ok(Some(Located {
                path: entry.path(),
                refs,
                len: entry.metadata()?.len(),
            }));
        }
        Ok(None)
    }

    fn chunk_path(&self, hex_id: &str, refs: u64) -> PathBuf {
        self.shard_dir(hex_id).join(format!("{hex_id}.{refs}"))
    }

    fn write_content(&self, hex_id: &str, target: &Path, content: &[u8]) -> Result<(), ChunkStoreError> {
        let dir = self.shard_dir(hex_id);
        fs::create_dir_all(&dir)?;
        let tmp = dir.join(format!("{hex_id}.{TMP_EXTENSION}"));
        fs::write(&tmp, content)?;
        fs::rename(&tmp, target)?;
        Ok(())
    }

    fn remove_reference(
        &self,
        summary: &mut Summary,
        found: &Located,
        hex_id: &str,
    ) -> Result<(), ChunkStoreError> {
        if found.refs > 1 {
            fs::rename(&found.path, self.chunk_path(hex_id, found.refs - 1))?;
        } else {
            fs::remove_file(&found.path)?;
            summary.size -= found.len;
        }
        summary.count -= 1;
        Ok(())
    }

    /// Moves one reference to another file store, transferring the file by
    /// rename when this store holds the last reference and the sink does not
    /// yet have the chunk. Falls back to copy-then-delete across
    /// filesystems.
    ///
    /// # Errors
    ///
    /// Same contract as [`ChunkStore::move_to`].
    pub fn move_file_to(&self, id: &ChunkId, sink: &Self) -> Result<(), ChunkStoreError> {
        if std::ptr::eq(self, sink) {
            return Err(ChunkStoreError::InvalidArgument(
                "cannot move a chunk onto its own store",
            ));
        }
        let mut summary = self.inner.write().unwrap();
        let hex_id = id.to_hex();
        let Some(found) = self.locate(id)? else {
            return Err(ChunkStoreError::NotFound);
        };
        if found.refs == 1 && !sink.has(id) {
            let mut sink_summary = sink.inner.write().unwrap();
            if !fits(sink_summary.size, found.len, sink_summary.capacity) {
                return Err(ChunkStoreError::OutOfCapacity);
            }
            let target = sink.chunk_path(&hex_id, 1);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            if fs::rename(&found.path, &target).is_err() {
                fs::copy(&found.path, &target)?;
                fs::remove_file(&found.path)?;
            }
            sink_summary.count += 1;
            sink_summary.size += found.len;
            summary.count -= 1;
            summary.size -= found.len;
            return Ok(());
        }
        let content = Bytes::from(fs::read(&found.path)?);
        if !sink.has(id) && !sink.vacant(found.len) {
            return Err(ChunkStoreError::OutOfCapacity);
        }
        sink.store(id, content)?;
        self.remove_reference(&mut summary, &found, &hex_id)
    }
}

impl ChunkStore for FileChunkStore {
    fn store(&self, id: &ChunkId, content: Bytes) -> Result<(), ChunkStoreError> {
        if content.is_empty() {
            return Err(ChunkStoreError::InvalidArgument("empty chunk content"));
        }
        let mut summary = self.inner.write().unwrap();
        let hex_id = id.to_hex();
        if let Some(found) = self.locate(id)? {
            fs::rename(&found.path, self.chunk_path(&hex_id, found.refs + 1))?;
            summary.count += 1;
            return Ok(());
        }
        let len = content.len() as u64;
        if !fits(summary.size, len, summary.capacity) {
            return Err(ChunkStoreError::OutOfCapacity);
        }
        self.write_content(&hex_id, &self.chunk_path(&hex_id, 1), &content)?;
        summary.count += 1;
        summary.size += len;
        Ok(())
    }

    fn get(&self, id: &ChunkId) -> Option<Bytes> {
        let _summary = self.inner.read().unwrap();
        match self.locate(id) {
            Ok(Some(found)) => match fs::read(&found.path) {
                Ok(content) => Some(Bytes::from(content)),
                Err(error) => {
                    warn!(%error, chunk = %id, "failed to read chunk file");
                    None
                }
            },
            Ok(None) => None,
            Err(error) => {
                warn!(%error, chunk = %id, "failed to locate chunk file");
                None
            }
        }
    }

    fn has(&self, id: &ChunkId) -> bool {
        let _summary = self.inner.read().unwrap();
        matches!(self.locate(id), Ok(Some(_)))
    }

    fn delete(&self, id: &ChunkId) -> Result<(), ChunkStoreError> {
        let mut summary = self.inner.write().unwrap();
        let hex_id = id.to_hex();
        match self.locate(id)? {
            Some(found) => self.remove_reference(&mut summary, &found, &hex_id),
            None => Ok(()),
        }
    }

    fn modify(&self, id: &ChunkId, content: Bytes) -> Result<(), ChunkStoreError> {
        if content.is_empty() {
            return Err(ChunkStoreError::InvalidArgument("empty chunk content"));
        }
        let mut summary = self.inner.write().unwrap();
        let hex_id = id.to_hex();
        let Some(found) = self.locate(id)? else {
            return Err(ChunkStoreError::NotFound);
        };
        let current = fs::read(&found.path)?;
        if id.matches_content(&current) {
            return if id.matches_content(&content) {
                Ok(())
            } else {
                Err(ChunkStoreError::Immutable)
            };
        }
        let new_len = content.len() as u64;
        let remaining = summary.size - found.len;
        if !fits(remaining, new_len, summary.capacity) {
            return Err(ChunkStoreError::OutOfCapacity);
        }
        self.write_content(&hex_id, &found.path, &content)?;
        summary.size = remaining + new_len;
        Ok(())
    }

    fn move_to(&self, id: &ChunkId, sink: &dyn ChunkStore) -> Result<(), ChunkStoreError> {
        if is_same_store(self, sink) {
            return Err(ChunkStoreError::InvalidArgument(
                "cannot move a chunk onto its own store",
            ));
        }
        let mut summary = self.inner.write().unwrap();
        let hex_id = id.to_hex();
        let Some(found) = self.locate(id)? else {
            return Err(ChunkStoreError::NotFound);
        };
        if !sink.has(id) && !sink.vacant(found.len) {
            return Err(ChunkStoreError::OutOfCapacity);
        }
        let content = Bytes::from(fs::read(&found.path)?);
        sink.store(id, content)?;
        self.remove_reference(&mut summary, &found, &hex_id)
    }

    fn count(&self) -> u64 {
        self.inner.read().unwrap().count
    }

    fn count_of(&self, id: &ChunkId) -> u64 {
        let _summary = self.inner.read().unwrap();
        match self.locate(id) {
            Ok(Some(found)) => found.refs,
            _ => 0,
        }
    }

    fn size(&self) -> u64 {
        self.inner.read().unwrap().size
    }

    fn size_of(&self, id: &ChunkId) -> u64 {
        let _summary = self.inner.read().unwrap();
        match self.locate(id) {
            Ok(Some(found)) => found.len,
            _ => 0,
        }
    }

    fn capacity(&self) -> u64 {
        self.inner.read().unwrap().capacity
    }

    fn set_capacity(&self, capacity: u64) {
        let mut summary = self.inner.write().unwrap();
        summary.capacity = clamped_capacity(capacity, summary.size);
    }

    fn vacant(&self, required: u64) -> bool {
        let summary = self.inner.read().unwrap();
        fits(summary.size, required, summary.capacity)
    }

    fn empty(&self) -> bool {
        self.inner.read().unwrap().count == 0
    }

    fn clear(&self) -> Result<(), ChunkStoreError> {
        let mut summary = self.inner.write().unwrap();
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }
        fs::create_dir_all(&self.root)?;
        summary.count = 0;
        summary.size = 0;
        Ok(())
    }
}

fn parse_refs(file_name: &str, hex_id: &str) -> Option<u64> {
    file_name
        .strip_prefix(hex_id)?
        .strip_prefix('.')?
        .parse()
        .ok()
}

fn scan_tree(dir: &Path) -> Result<(u64, u64), ChunkStoreError> {
    let mut count = 0;
    let mut size = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            let (sub_count, sub_size) = scan_tree(&entry.path())?;
            count += sub_count;
            size += sub_size;
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some((_, refs)) = name.rsplit_once('.') else {
            continue;
        };
        let Ok(refs) = refs.parse::<u64>() else {
            // leftover temporary files are not part of the store
            continue;
        };
        count += refs;
        size += entry.metadata()?.len();
    }
    Ok((count, size))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn content(len: usize) -> Bytes {
        Bytes::from(vec![0x2f_u8; len])
    }

    fn mutable_id(seed: u8) -> ChunkId {
        ChunkId::new(vec![seed; 65]).unwrap()
    }

    #[test]
    fn store_writes_a_refcount_one_file() {
        let dir = TempDir::new().unwrap();
        let store = FileChunkStore::open(dir.path().join("chunks")).unwrap();
        let payload = Bytes::from_static(b"durable payload");
        let id = ChunkId::hash_of(&payload);

        store.store(&id, payload.clone()).unwrap();

        let hex_id = id.to_hex();
        let expected = store.shard_dir(&hex_id).join(format!("{hex_id}.1"));
        assert!(expected.exists());
        assert_eq!(store.get(&id), Some(payload));
        assert_eq!(store.count(), 1);
        assert_eq!(store.size(), 15);
    }

    #[test]
    fn refcount_changes_are_renames() {
        let dir = TempDir::new().unwrap();
        let store = FileChunkStore::open(dir.path().join("chunks")).unwrap();
        let id = mutable_id(1);
        let hex_id = id.to_hex();

        store.store(&id, content(10)).unwrap();
        store.store(&id, content(10)).unwrap();
        store.store(&id, content(10)).unwrap();

        assert!(store.chunk_path(&hex_id, 3).exists());
        assert!(!store.chunk_path(&hex_id, 1).exists());
        assert_eq!(store.count_of(&id), 3);
        assert_eq!(store.size(), 10);

        store.delete(&id).unwrap();
        assert!(store.chunk_path(&hex_id, 2).exists());

        store.delete(&id).unwrap();
        store.delete(&id).unwrap();
        assert!(!store.has(&id));
        assert_eq!(store.size(), 0);

        // absent id: still a success
        store.delete(&id).unwrap();
    }

    #[test]
    fn restart_recovers_the_summary_by_scanning() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("chunks");
        {
            let store = FileChunkStore::open(&root).unwrap();
            let id_a = mutable_id(2);
            store.store(&id_a, content(100)).unwrap();
            store.store(&id_a, content(100)).unwrap();
            store.store(&mutable_id(3), content(50)).unwrap();
        }

        let reopened = FileChunkStore::open(&root).unwrap();
        assert_eq!(reopened.count(), 3);
        assert_eq!(reopened.size(), 150);
        assert_eq!(reopened.count_of(&mutable_id(2)), 2);
        assert_eq!(reopened.get(&mutable_id(3)), Some(content(50)));
    }

    #[test]
    fn sharding_places_files_under_hex_prefix_directories() {
        let dir = TempDir::new().unwrap();
        let store = FileChunkStore::with_depth(dir.path().join("chunks"), 2).unwrap();
        let id = ChunkId::new(vec![0xab, 0xcd, 0xef]).unwrap();
        store.store(&id, content(5)).unwrap();

        let expected = dir
            .path()
            .join("chunks")
            .join("a")
            .join("b")
            .join("abcdef.1");
        assert!(expected.exists());
    }

    #[test]
    fn modify_rewrites_mutable_chunks_in_place() {
        let dir = TempDir::new().unwrap();
        let store = FileChunkStore::open(dir.path().join("chunks")).unwrap();
        let id = mutable_id(4);
        store.store(&id, content(10)).unwrap();
        store.store(&id, content(10)).unwrap();

        store.modify(&id, Bytes::from_static(b"new bytes")).unwrap();
        assert_eq!(store.get(&id), Some(Bytes::from_static(b"new bytes")));
        assert_eq!(store.count_of(&id), 2);
        assert_eq!(store.size(), 9);
    }

    #[test]
    fn modify_on_hash_named_chunk_requires_matching_bytes() {
        let dir = TempDir::new().unwrap();
        let store = FileChunkStore::open(dir.path().join("chunks")).unwrap();
        let payload = Bytes::from_static(b"sealed");
        let id = ChunkId::hash_of(&payload);
        store.store(&id, payload.clone()).unwrap();

        assert!(matches!(
            store.modify(&id, Bytes::from_static(b"tampered")),
            Err(ChunkStoreError::Immutable)
        ));
        store.modify(&id, payload.clone()).unwrap();
        assert_eq!(store.get(&id), Some(payload));
    }

    #[test]
    fn capacity_applies_to_new_chunks_only() {
        let dir = TempDir::new().unwrap();
        let store = FileChunkStore::open(dir.path().join("chunks")).unwrap();
        store.set_capacity(100);
        let id = mutable_id(5);
        store.store(&id, content(80)).unwrap();

        assert!(matches!(
            store.store(&mutable_id(6), content(30)),
            Err(ChunkStoreError::OutOfCapacity)
        ));
        store.store(&id, content(80)).unwrap();
        assert_eq!(store.count_of(&id), 2);
    }

    #[test]
    fn move_to_another_file_store() {
        let dir = TempDir::new().unwrap();
        let source = FileChunkStore::open(dir.path().join("a")).unwrap();
        let sink = FileChunkStore::open(dir.path().join("b")).unwrap();
        let id = mutable_id(7);
        source.store(&id, content(40)).unwrap();

        source.move_to(&id, &sink).unwrap();
        assert!(!source.has(&id));
        assert_eq!(sink.count_of(&id), 1);
        assert_eq!(sink.get(&id), Some(content(40)));
    }

    #[test]
    fn move_file_to_renames_the_last_reference() {
        let dir = TempDir::new().unwrap();
        let source = FileChunkStore::open(dir.path().join("a")).unwrap();
        let sink = FileChunkStore::open(dir.path().join("b")).unwrap();
        let id = mutable_id(13);
        source.store(&id, content(40)).unwrap();

        source.move_file_to(&id, &sink).unwrap();
        assert!(!source.has(&id));
        assert_eq!(source.size(), 0);
        assert_eq!(sink.count_of(&id), 1);
        assert_eq!(sink.get(&id), Some(content(40)));

        // with several references only one is transferred
        source.store(&id, content(40)).unwrap();
        source.store(&id, content(40)).unwrap();
        source.move_file_to(&id, &sink).unwrap();
        assert_eq!(source.count_of(&id), 1);
        assert_eq!(sink.count_of(&id), 2);
    }

    #[test]
    fn move_to_memory_store_respects_capacity() {
        let dir = TempDir::new().unwrap();
        let source = FileChunkStore::open(dir.path().join("a")).unwrap();
        let sink = super::super::MemoryChunkStore::with_capacity(10);
        let id = mutable_id(8);
        source.store(&id, content(40)).unwrap();

        assert!(matches!(
            source.move_to(&id, &sink),
            Err(ChunkStoreError::OutOfCapacity)
        ));
        assert!(source.has(&id));
    }

    #[test]
    fn clear_removes_the_tree() {
        let dir = TempDir::new().unwrap();
        let store = FileChunkStore::open(dir.path().join("chunks")).unwrap();
        store.store(&mutable_id(9), content(10)).unwrap();
        store.set_capacity(1000);

        store.clear().unwrap();
        assert!(store.empty());
        assert_eq!(store.size(), 0);
        assert_eq!(store.capacity(), 1000);
        assert!(!store.has(&mutable_id(9)));
    }
}
