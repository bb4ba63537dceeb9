//! Buffered chunk store: a bounded FIFO cache over a permanent file store.
//!
//! `store` admits the bytes to the cache and schedules the permanent write
//! on the background [`WriteExecutor`]; the call returns once the write is
//! enqueued, not once it is durable. A pending-write table keeps the effects
//! visible in program order: `has` and `get` consult it, and operations that
//! need the permanent layer for an id first wait for that id's queued writes
//! to drain.
//!
//! Deletion is deferred through marks. Each `mark_for_deletion` cancels one
//! reference; a chunk stays "permanently held" until its marks reach its
//! reference count, after which `delete_all_marked` reclaims it. A
//! `permanent_store` issued while marks are outstanding clears one mark
//! instead of adding a reference, reinstating the chunk.
//!
//! Cache eviction is strict FIFO on first-insertion order; re-inserting a
//! present id does not refresh its position. An entry larger than the cache
//! capacity leaves the cache untouched.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use bytes::Bytes;
use tracing::warn;

use super::{
    is_same_store, ChunkId, ChunkStore, ChunkStoreError, FileChunkStore, MemoryChunkStore,
    WriteExecutor,
};

struct Job {
    epoch: u64,
    op: JobOp,
}

enum JobOp {
    Store { id: ChunkId, content: Bytes },
    Modify { id: ChunkId, content: Bytes },
}

impl JobOp {
    fn id(&self) -> &ChunkId {
        let (Self::Store { id, .. } | Self::Modify { id, .. }) = self;
        id
    }
}

#[derive(Default)]
struct Inner {
    cache_order: VecDeque<ChunkId>,
    pending: HashMap<ChunkId, u64>,
    jobs: VecDeque<Job>,
    draining: bool,
    epoch: u64,
    marked: Vec<ChunkId>,
}

struct State {
    permanent: FileChunkStore,
    cache: MemoryChunkStore,
    executor: WriteExecutor,
    inner: Mutex<Inner>,
    drained: Condvar,
}

/// A layered chunk store composing a FIFO-bounded in-memory cache with a
/// durable [`FileChunkStore`].
pub struct BufferedChunkStore {
    state: Arc<State>,
}

impl BufferedChunkStore {
    /// Creates a buffered store over `permanent`, scheduling background
    /// writes on `executor`. The cache starts unbounded.
    #[must_use]
    pub fn new(permanent: FileChunkStore, executor: WriteExecutor) -> Self {
        Self {
            state: Arc::new(State {
                permanent,
                cache: MemoryChunkStore::new(),
                executor,
                inner: Mutex::new(Inner::default()),
                drained: Condvar::new(),
            }),
        }
    }

    /// Inserts bytes into the cache only; the permanent layer and its
    /// reference counts are untouched. Inserting a present id is a no-op
    /// that keeps the id's FIFO position.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkStoreError::InvalidArgument`] for empty content and
    /// [`ChunkStoreError::OutOfCapacity`] when the bytes cannot be admitted
    /// even after evicting the whole cache.
    pub fn cache_store(&self, id: &ChunkId, content: Bytes) -> Result<(), ChunkStoreError> {
        if content.is_empty() {
            return Err(ChunkStoreError::InvalidArgument("empty chunk content"));
        }
        let mut inner = self.state.inner.lock().unwrap();
        if self.admit_to_cache(&mut inner, id, &content) {
            Ok(())
        } else {
            Err(ChunkStoreError::OutOfCapacity)
        }
    }

    /// Promotes a chunk into the permanent layer.
    ///
    /// With deletion marks outstanding one mark is cleared instead of adding
    /// a reference. Otherwise a cached chunk gains one permanent reference;
    /// a chunk already permanent is left as it is.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkStoreError::NotFound`] when the id is absent from both
    /// layers, and the permanent store's errors otherwise.
    pub fn permanent_store(&self, id: &ChunkId) -> Result<(), ChunkStoreError> {
        let inner = self.state.inner.lock().unwrap();
        let mut inner = self.wait_for_pending(inner, id);
        if let Some(position) = inner.marked.iter().position(|marked| marked == id) {
            inner.marked.remove(position);
            return Ok(());
        }
        if let Some(content) = self.state.cache.get(id) {
            if !self.state.permanent.has(id) && !self.state.permanent.vacant(content.len() as u64)
            {
                reclaim_marked(&self.state, &mut inner, content.len() as u64);
            }
            return self.state.permanent.store(id, content);
        }
        if self.state.permanent.has(id) {
            return Ok(());
        }
        Err(ChunkStoreError::NotFound)
    }

    /// Records one deletion intent against the permanent copy.
    pub fn mark_for_deletion(&self, id: &ChunkId) {
        let inner = self.state.inner.lock().unwrap();
        let mut inner = self.wait_for_pending(inner, id);
        inner.marked.push(id.clone());
    }

    /// Returns the chunks currently marked for deletion, one entry per mark.
    #[must_use]
    pub fn removable_chunks(&self) -> Vec<ChunkId> {
        self.state.inner.lock().unwrap().marked.clone()
    }

    /// Applies every recorded deletion mark against the permanent layer.
    ///
    /// # Errors
    ///
    /// Returns the first permanent-layer error; unapplied marks are
    /// retained.
    pub fn delete_all_marked(&self) -> Result<(), ChunkStoreError> {
        let inner = self.state.inner.lock().unwrap();
        let mut inner = self.wait_for_all(inner);
        let marked = std::mem::take(&mut inner.marked);
        for (index, id) in marked.iter().enumerate() {
            if let Err(error) = self.state.permanent.delete(id) {
                inner.marked.extend_from_slice(&marked[index..]);
                return Err(error);
            }
        }
        Ok(())
    }

    /// Returns `true` when the cache holds the id.
    #[must_use]
    pub fn cache_has(&self, id: &ChunkId) -> bool {
        let _inner = self.state.inner.lock().unwrap();
        self.state.cache.has(id)
    }

    /// Returns `true` when the permanent layer holds the id with more
    /// references than outstanding deletion marks.
    #[must_use]
    pub fn permanent_has(&self, id: &ChunkId) -> bool {
        let inner = self.state.inner.lock().unwrap();
        let inner = self.wait_for_pending(inner, id);
        permanent_refs_minus_marks(&self.state, &inner, id) > 0
    }

    /// Number of distinct chunks in the cache.
    #[must_use]
    pub fn cache_count(&self) -> u64 {
        let _inner = self.state.inner.lock().unwrap();
        self.state.cache.count()
    }

    /// Total bytes held by the cache.
    #[must_use]
    pub fn cache_size(&self) -> u64 {
        let _inner = self.state.inner.lock().unwrap();
        self.state.cache.size()
    }

    /// Cache capacity; 0 means unbounded.
    #[must_use]
    pub fn cache_capacity(&self) -> u64 {
        let _inner = self.state.inner.lock().unwrap();
        self.state.cache.capacity()
    }

    /// Sets the cache capacity, clamping up to the current cache size.
    /// Shrinking below the current size defers eviction to the next
    /// admission.
    pub fn set_cache_capacity(&self, capacity: u64) {
        let _inner = self.state.inner.lock().unwrap();
        self.state.cache.set_capacity(capacity);
    }

    /// Returns `true` when `required` additional bytes would fit in the
    /// cache without eviction.
    #[must_use]
    pub fn cache_vacant(&self, required: u64) -> bool {
        let _inner = self.state.inner.lock().unwrap();
        self.state.cache.vacant(required)
    }

    /// Returns `true` when the cache is empty.
    #[must_use]
    pub fn cache_empty(&self) -> bool {
        let _inner = self.state.inner.lock().unwrap();
        self.state.cache.empty()
    }

    /// Empties the cache; the permanent layer is untouched.
    pub fn cache_clear(&self) {
        let mut inner = self.state.inner.lock().unwrap();
        inner.cache_order.clear();
        if let Err(error) = self.state.cache.clear() {
            warn!(%error, "failed to clear chunk cache");
        }
    }

    /// FIFO admission: evicts head entries until the bytes fit, refusing
    /// entries larger than the whole cache.
    fn admit_to_cache(&self, inner: &mut Inner, id: &ChunkId, content: &Bytes) -> bool {
        if self.state.cache.has(id) {
            return true;
        }
        let len = content.len() as u64;
        let capacity = self.state.cache.capacity();
        if capacity > 0 && len > capacity {
            return false;
        }
        while capacity > 0 && self.state.cache.size() + len > capacity {
            let Some(victim) = inner.cache_order.pop_front() else {
                break;
            };
            if let Err(error) = self.state.cache.delete(&victim) {
                warn!(%error, chunk = %victim, "failed to evict cached chunk");
            }
        }
        match self.state.cache.store(id, content.clone()) {
            Ok(()) => {
                inner.cache_order.push_back(id.clone());
                true
            }
            Err(_) => false,
        }
    }

    fn enqueue(&self, inner: &mut Inner, op: JobOp) {
        *inner.pending.entry(op.id().clone()).or_insert(0) += 1;
        inner.jobs.push_back(Job {
            epoch: inner.epoch,
            op,
        });
        if !inner.draining {
            inner.draining = true;
            let state = Arc::clone(&self.state);
            self.state.executor.submit(move || drain(&state));
        }
    }

    fn wait_for_pending<'a>(
        &self,
        mut inner: MutexGuard<'a, Inner>,
        id: &ChunkId,
    ) -> MutexGuard<'a, Inner> {
        while inner.pending.contains_key(id) {
            inner = self.state.drained.wait(inner).unwrap();
        }
        inner
    }

    fn wait_for_all<'a>(&self, mut inner: MutexGuard<'a, Inner>) -> MutexGuard<'a, Inner> {
        while !inner.pending.is_empty() {
            inner = self.state.drained.wait(inner).unwrap();
        }
        inner
    }
}

impl ChunkStore for BufferedChunkStore {
    /// Stores into the permanent layer through the background executor,
    /// admitting the bytes to the cache on the way.
    fn store(&self, id: &ChunkId, content: Bytes) -> Result<(), ChunkStoreError> {
        if content.is_empty() {
            return Err(ChunkStoreError::InvalidArgument("empty chunk content"));
        }
        let mut inner = self.state.inner.lock().unwrap();
        self.admit_to_cache(&mut inner, id, &content);
        self.enqueue(
            &mut inner,
            JobOp::Store {
                id: id.clone(),
                content,
            },
        );
        Ok(())
    }

    fn get(&self, id: &ChunkId) -> Option<Bytes> {
        let mut inner = self.state.inner.lock().unwrap();
        if let Some(content) = self.state.cache.get(id) {
            return Some(content);
        }
        let queued = inner.jobs.iter().rev().find_map(|job| {
            let (JobOp::Store { id: job_id, content } | JobOp::Modify { id: job_id, content }) =
                &job.op;
            (job_id == id).then(|| content.clone())
        });
        if let Some(content) = queued {
            self.admit_to_cache(&mut inner, id, &content);
            return Some(content);
        }
        let content = self.state.permanent.get(id)?;
        self.admit_to_cache(&mut inner, id, &content);
        Some(content)
    }

    fn has(&self, id: &ChunkId) -> bool {
        let inner = self.state.inner.lock().unwrap();
        if self.state.cache.has(id) || inner.pending.contains_key(id) {
            return true;
        }
        permanent_refs_minus_marks(&self.state, &inner, id) > 0
    }

    fn delete(&self, id: &ChunkId) -> Result<(), ChunkStoreError> {
        let inner = self.state.inner.lock().unwrap();
        let mut inner = self.wait_for_pending(inner, id);
        if self.state.cache.has(id) {
            inner.cache_order.retain(|cached| cached != id);
            self.state.cache.delete(id)?;
        }
        self.state.permanent.delete(id)
    }

    fn modify(&self, id: &ChunkId, content: Bytes) -> Result<(), ChunkStoreError> {
        if content.is_empty() {
            return Err(ChunkStoreError::InvalidArgument("empty chunk content"));
        }
        let inner = self.state.inner.lock().unwrap();
        let mut inner = self.wait_for_pending(inner, id);
        let current = self
            .state
            .cache
            .get(id)
            .or_else(|| self.state.permanent.get(id))
            .ok_or(ChunkStoreError::NotFound)?;
        if id.matches_content(&current) {
            return if id.matches_content(&content) {
                Ok(())
            } else {
                Err(ChunkStoreError::Immutable)
            };
        }
        if self.state.cache.has(id) {
            self.state.cache.modify(id, content.clone())?;
        }
        if self.state.permanent.has(id) {
            self.enqueue(
                &mut inner,
                JobOp::Modify {
                    id: id.clone(),
                    content,
                },
            );
        }
        Ok(())
    }

    fn move_to(&self, id: &ChunkId, sink: &dyn ChunkStore) -> Result<(), ChunkStoreError> {
        if is_same_store(self, sink) {
            return Err(ChunkStoreError::InvalidArgument(
                "cannot move a chunk onto its own store",
            ));
        }
        let content = self.get(id).ok_or(ChunkStoreError::NotFound)?;
        if !sink.has(id) && !sink.vacant(content.len() as u64) {
            return Err(ChunkStoreError::OutOfCapacity);
        }
        sink.store(id, content)?;
        self.delete(id)
    }

    fn count(&self) -> u64 {
        let inner = self.state.inner.lock().unwrap();
        let _inner = self.wait_for_all(inner);
        self.state.permanent.count()
    }

    fn count_of(&self, id: &ChunkId) -> u64 {
        let inner = self.state.inner.lock().unwrap();
        let _inner = self.wait_for_pending(inner, id);
        self.state.permanent.count_of(id)
    }

    fn size(&self) -> u64 {
        let inner = self.state.inner.lock().unwrap();
        let _inner = self.wait_for_all(inner);
        self.state.permanent.size()
    }

    fn size_of(&self, id: &ChunkId) -> u64 {
        let inner = self.state.inner.lock().unwrap();
        let _inner = self.wait_for_pending(inner, id);
        self.state.permanent.size_of(id)
    }

    fn capacity(&self) -> u64 {
        self.state.permanent.capacity()
    }

    fn set_capacity(&self, capacity: u64) {
        self.state.permanent.set_capacity(capacity);
    }

    fn vacant(&self, required: u64) -> bool {
        self.state.permanent.vacant(required)
    }

    fn empty(&self) -> bool {
        let inner = self.state.inner.lock().unwrap();
        let _inner = self.wait_for_all(inner);
        self.state.cache.empty() && self.state.permanent.count() == 0
    }

    /// Empties both layers and silently cancels queued background writes.
    fn clear(&self) -> Result<(), ChunkStoreError> {
        let mut inner = self.state.inner.lock().unwrap();
        inner.epoch += 1;
        inner.jobs.clear();
        inner.pending.clear();
        inner.marked.clear();
        inner.cache_order.clear();
        self.state.cache.clear()?;
        self.state.drained.notify_all();
        self.state.permanent.clear()
    }
}

fn permanent_refs_minus_marks(state: &State, inner: &Inner, id: &ChunkId) -> u64 {
    let marks = inner.marked.iter().filter(|marked| *marked == id).count() as u64;
    state.permanent.count_of(id).saturating_sub(marks)
}

fn reclaim_marked(state: &State, inner: &mut Inner, required: u64) {
    while !state.permanent.vacant(required) && !inner.marked.is_empty() {
        let victim = inner.marked.remove(0);
        if let Err(error) = state.permanent.delete(&victim) {
            warn!(%error, chunk = %victim, "failed to reclaim marked chunk");
        }
    }
}

/// Applies this store's queued jobs in submission order. Runs on the write
/// executor; holds the store lock while a job applies so foreground
/// operations observe whole jobs only.
fn drain(state: &State) {
    let mut inner = state.inner.lock().unwrap();
    loop {
        let Some(job) = inner.jobs.pop_front() else {
            inner.draining = false;
            state.drained.notify_all();
            return;
        };
        if job.epoch != inner.epoch {
            continue;
        }
        match job.op {
            JobOp::Store { id, content } => {
                if !state.permanent.has(&id) && !state.permanent.vacant(content.len() as u64) {
                    reclaim_marked(state, &mut inner, content.len() as u64);
                }
                if let Err(error) = state.permanent.store(&id, content) {
                    warn!(%error, chunk = %id, "background chunk store failed");
                }
                finish_pending(&mut inner, &id);
            }
            JobOp::Modify { id, content } => {
                if let Err(error) = state.permanent.modify(&id, content) {
                    warn!(%error, chunk = %id, "background chunk modify failed");
                }
                finish_pending(&mut inner, &id);
            }
        }
        state.drained.notify_all();
    }
}

fn finish_pending(inner: &mut Inner, id: &ChunkId) {
    if let Some(outstanding) = inner.pending.get_mut(id) {
        *outstanding -= 1;
        if *outstanding == 0 {
            inner.pending.remove(id);
        }
    }
}
