//! Per-chunk-type action policy.
//!
//! The stores themselves are value-neutral; layers above them consult a
//! [`ChunkActionAuthority`] to decide whether an id is hash-named, whether
//! an actor may replace its bytes, and whether an actor may delete it. The
//! chunk type is derived from the id: digest-length ids are plain content
//! chunks, longer ids carry a type byte as their first byte.

use super::{ChunkId, HASH_ID_LENGTH};

/// Type byte of chunks whose bytes the owner may replace.
pub const TYPE_MODIFIABLE: u8 = 0x01;

/// Policy consulted before chunk validation and modification.
pub trait ChunkActionAuthority: Send + Sync {
    /// Returns `true` when the id names an immutable, content-hashed chunk.
    fn is_hash_named(&self, id: &ChunkId) -> bool;

    /// Returns `true` when `actor` may replace the chunk's bytes.
    fn may_modify(&self, id: &ChunkId, actor: &str) -> bool;

    /// Returns `true` when `actor` may delete the chunk.
    fn may_delete(&self, id: &ChunkId, actor: &str) -> bool;
}

/// The default policy.
///
/// Digest-length ids are hash-named and immutable but freely deletable by
/// their holder. Typed ids are mutable only when their type byte says so.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultChunkActionAuthority;

impl DefaultChunkActionAuthority {
    fn type_byte(id: &ChunkId) -> Option<u8> {
        if id.as_bytes().len() == HASH_ID_LENGTH {
            None
        } else {
            id.as_bytes().first().copied()
        }
    }
}

impl ChunkActionAuthority for DefaultChunkActionAuthority {
    fn is_hash_named(&self, id: &ChunkId) -> bool {
        Self::type_byte(id).is_none()
    }

    fn may_modify(&self, id: &ChunkId, actor: &str) -> bool {
        !actor.is_empty() && Self::type_byte(id) == Some(TYPE_MODIFIABLE)
    }

    fn may_delete(&self, _id: &ChunkId, actor: &str) -> bool {
        !actor.is_empty()
    }
}
