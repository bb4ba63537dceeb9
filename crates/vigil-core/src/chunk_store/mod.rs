//! Content-addressed chunk stores with reference counting.
//!
//! A store holds a multiset of chunks: the same id may be present with a
//! positive reference count. Storing an id that is already present bumps the
//! count and ignores the new bytes (storage is first-write-wins); deleting
//! decrements and erases at zero. A store may carry an optional capacity,
//! measured over distinct chunk bytes.
//!
//! Three implementations share the [`ChunkStore`] trait:
//!
//! - [`MemoryChunkStore`]: an in-memory map
//! - [`FileChunkStore`]: durable storage with the reference count encoded in
//!   the filename, so a restart recovers state by directory scan
//! - [`BufferedChunkStore`]: a bounded FIFO cache layered over a permanent
//!   file store, with deferred background writes and a deletion-mark
//!   lifecycle
//!
//! Chunk ids are opaque non-empty byte strings. An id that equals the
//! SHA-512 digest of its stored bytes is *hash-named*, and hash-named chunks
//! are immutable: `modify` only accepts replacement bytes that hash back to
//! the same id.

mod authority;
mod buffered;
mod executor;
mod file;
mod memory;

use bytes::Bytes;
use sha2::{Digest, Sha512};

pub use authority::{ChunkActionAuthority, DefaultChunkActionAuthority, TYPE_MODIFIABLE};
pub use buffered::BufferedChunkStore;
pub use executor::WriteExecutor;
pub use file::FileChunkStore;
pub use memory::MemoryChunkStore;

/// Length in bytes of a hash-named chunk id.
pub const HASH_ID_LENGTH: usize = 64;

/// Errors raised by chunk store operations.
#[derive(Debug, thiserror::Error)]
pub enum ChunkStoreError {
    /// Empty id, empty content or otherwise malformed input.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The id is absent from the store.
    #[error("chunk not found")]
    NotFound,

    /// The operation would push the store past its capacity.
    #[error("store capacity exceeded")]
    OutOfCapacity,

    /// A hash-named chunk was given replacement bytes that do not hash to
    /// its id.
    #[error("hash-named chunks are immutable")]
    Immutable,

    /// A filesystem operation failed; store invariants are preserved.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// An opaque, non-empty chunk identifier.
///
/// Conventionally the SHA-512 digest of the chunk content, in which case the
/// chunk is hash-named and immutable; ids of any other non-zero length name
/// mutable chunks.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(Vec<u8>);

impl ChunkId {
    /// Wraps raw id bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkStoreError::InvalidArgument`] for an empty id.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, ChunkStoreError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(ChunkStoreError::InvalidArgument("empty chunk id"));
        }
        Ok(Self(bytes))
    }

    /// Returns the hash-named id of `content`.
    #[must_use]
    pub fn hash_of(content: &[u8]) -> Self {
        Self(Sha512::digest(content).to_vec())
    }

    /// Returns `true` when this id is the content hash of `content`.
    #[must_use]
    pub fn matches_content(&self, content: &[u8]) -> bool {
        self.0.len() == HASH_ID_LENGTH && self.0 == Sha512::digest(content).as_slice()
    }

    /// The raw id bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Hex encoding of the id, as used in on-disk filenames.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hex = self.to_hex();
        write!(f, "{}", &hex[..hex.len().min(16)])
    }
}

impl std::fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChunkId({})", self.to_hex())
    }
}

/// Common operations over the store hierarchy.
///
/// The implementation is chosen at construction; consumers hold the concrete
/// type or an `Arc<dyn ChunkStore>`.
pub trait ChunkStore: Send + Sync {
    /// Stores one reference to a chunk.
    ///
    /// If the id is already present the reference count is bumped and
    /// `content` is ignored; otherwise the bytes are stored, subject to the
    /// capacity limit.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkStoreError::InvalidArgument`] for empty content,
    /// [`ChunkStoreError::OutOfCapacity`] when a new chunk does not fit, and
    /// [`ChunkStoreError::Io`] on filesystem failure.
    fn store(&self, id: &ChunkId, content: Bytes) -> Result<(), ChunkStoreError>;

    /// Returns the stored bytes, or `None` when absent. Read-only.
    fn get(&self, id: &ChunkId) -> Option<Bytes>;

    /// Returns `true` when the id is present with a positive count.
    fn has(&self, id: &ChunkId) -> bool;

    /// Drops one reference, erasing the chunk at zero. Deleting an absent id
    /// succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkStoreError::Io`] on filesystem failure.
    fn delete(&self, id: &ChunkId) -> Result<(), ChunkStoreError>;

    /// Replaces the stored bytes without changing the reference count.
    ///
    /// Hash-named chunks only accept replacement bytes that hash back to
    /// their id.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkStoreError::NotFound`] for an absent id,
    /// [`ChunkStoreError::Immutable`] for a hash-named chunk with foreign
    /// bytes, and [`ChunkStoreError::OutOfCapacity`] when the size delta
    /// does not fit.
    fn modify(&self, id: &ChunkId, content: Bytes) -> Result<(), ChunkStoreError>;

    /// Atomically transfers one reference to `sink`.
    ///
    /// Succeeds iff the id is present here and `sink` accepts one reference
    /// without exceeding its capacity (unless the id is already present
    /// there). Moving onto the same store fails.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkStoreError::InvalidArgument`] for a same-store move,
    /// [`ChunkStoreError::NotFound`] when absent here, and
    /// [`ChunkStoreError::OutOfCapacity`] when `sink` cannot take the chunk.
    fn move_to(&self, id: &ChunkId, sink: &dyn ChunkStore) -> Result<(), ChunkStoreError>;

    /// Sum of the reference counts of all chunks.
    fn count(&self) -> u64;

    /// Reference count of one chunk; 0 when absent.
    fn count_of(&self, id: &ChunkId) -> u64;

    /// Total stored bytes, counted once per distinct chunk.
    fn size(&self) -> u64;

    /// Stored byte length of one chunk; 0 when absent.
    fn size_of(&self, id: &ChunkId) -> u64;

    /// Current capacity; 0 means unbounded.
    fn capacity(&self) -> u64;

    /// Sets the capacity, clamping up to the current size when the store
    /// already exceeds the requested value. 0 means unbounded.
    fn set_capacity(&self, capacity: u64);

    /// Returns `true` when `required` additional bytes would fit.
    fn vacant(&self, required: u64) -> bool;

    /// Returns `true` when no chunk is held.
    fn empty(&self) -> bool {
        self.count() == 0
    }

    /// Removes every chunk.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkStoreError::Io`] on filesystem failure.
    fn clear(&self) -> Result<(), ChunkStoreError>;
}

/// Detects a move onto the very store it originates from.
fn is_same_store<T>(source: &T, sink: &dyn ChunkStore) -> bool {
    std::ptr::eq(
        (source as *const T).cast::<u8>(),
        (sink as *const dyn ChunkStore).cast::<u8>(),
    )
}

/// Capacity arithmetic shared by the implementations.
const fn fits(size: u64, additional: u64, capacity: u64) -> bool {
    capacity == 0 || size + additional <= capacity
}

/// Clamp rule for `set_capacity`.
const fn clamped_capacity(requested: u64, size: u64) -> u64 {
    if requested == 0 {
        0
    } else if requested < size {
        size
    } else {
        requested
    }
}
