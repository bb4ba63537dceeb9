//! Background write executor shared by buffered chunk stores.
//!
//! A small fixed pool of worker threads runs queued write jobs. Each
//! [`BufferedChunkStore`](super::BufferedChunkStore) drains its own job
//! queue one entry at a time, so a single store's writes always apply in
//! submission order while the pool is shared between stores.
//!
//! Dropping every handle stops the workers; whatever is still queued is
//! abandoned silently.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

/// Default number of worker threads.
pub const DEFAULT_WRITE_THREADS: usize = 3;

const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

type Task = Box<dyn FnOnce() + Send>;

struct Shared {
    queue: Mutex<VecDeque<Task>>,
    available: Condvar,
}

/// Handle to the background write thread pool.
#[derive(Clone)]
pub struct WriteExecutor {
    shared: Arc<Shared>,
}

impl WriteExecutor {
    /// Starts a pool with the given number of worker threads (at least one).
    #[must_use]
    pub fn new(threads: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        });
        for index in 0..threads.max(1) {
            let weak = Arc::downgrade(&shared);
            std::thread::Builder::new()
                .name(format!("chunk-write-{index}"))
                .spawn(move || worker(&weak))
                .expect("failed to spawn chunk write thread");
        }
        Self { shared }
    }

    /// Queues a task for execution on the pool.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        let mut queue = self.shared.queue.lock().unwrap();
        queue.push_back(Box::new(task));
        self.shared.available.notify_one();
    }
}

impl Default for WriteExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_WRITE_THREADS)
    }
}

impl std::fmt::Debug for WriteExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queued = self.shared.queue.lock().unwrap().len();
        f.debug_struct("WriteExecutor").field("queued", &queued).finish()
    }
}

fn worker(shared: &Weak<Shared>) {
    loop {
        let task = {
            // hold the Arc only while polling so dropped handles are noticed
            let Some(shared) = shared.upgrade() else { return };
            let mut queue = shared.queue.lock().unwrap();
            if let Some(task) = queue.pop_front() {
                Some(task)
            } else {
                let (mut queue, _) = shared
                    .available
                    .wait_timeout(queue, SHUTDOWN_POLL)
                    .unwrap();
                queue.pop_front()
            }
        };
        if let Some(task) = task {
            task();
        }
    }
}
