//! Where deferred drains and load tasks run.
//!
//! Production schedulers use a dedicated rayon pool so blocking provider I/O
//! never competes with the host's own rayon work. Hosts that drive everything
//! from a frame loop can use [`LocalQueueSpawner`] and pump it each frame.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::error::PrefetchResult;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks submitted by the scheduler.
pub trait TaskSpawner: Send + Sync {
    fn spawn(&self, task: Task);
}

/// Spawner backed by a dedicated, named rayon pool.
pub struct RayonSpawner {
    pool: rayon::ThreadPool,
}

impl RayonSpawner {
    /// Create a pool with `num_threads` workers named `volplay-prefetch-N`.
    pub fn new(num_threads: usize) -> PrefetchResult<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|idx| format!("volplay-prefetch-{}", idx))
            .build()?;
        Ok(Self { pool })
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl TaskSpawner for RayonSpawner {
    fn spawn(&self, task: Task) {
        self.pool.spawn(task);
    }
}

/// Queue of tasks run only when the host pumps it.
#[derive(Default)]
pub struct LocalQueueSpawner {
    queue: Mutex<VecDeque<Task>>,
}

impl LocalQueueSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued tasks.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Run the tasks queued at the time of the call, in order.
    ///
    /// Tasks they spawn wait for the next call. Returns the number run.
    pub fn run_pending(&self) -> usize {
        let batch: Vec<Task> = self.queue.lock().drain(..).collect();
        let ran = batch.len();
        for task in batch {
            task();
        }
        ran
    }

    /// Run tasks until the queue stays empty. Returns the number run.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            // Lock released before the task runs; tasks may spawn more
            let next = self.queue.lock().pop_front();
            match next {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

impl TaskSpawner for LocalQueueSpawner {
    fn spawn(&self, task: Task) {
        self.queue.lock().push_back(task);
    }
}
