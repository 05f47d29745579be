//! Sharded worker pool
//!
//! [`WorkerPool`] owns `n` [`BoundedQueue`]s and one thread per queue. Items
//! are routed by an xxhash64 of their shard key, so every item for one
//! object lands on the same queue and is processed in enqueue order by the
//! same thread.

use crate::affinity;
use crate::perf::DispatchStats;
use crate::queue::{BoundedQueue, ShutdownError};
use parking_lot::Mutex;
use radosproxy_common::{Error, Result};
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Items that can be routed to a queue
pub trait ShardKey {
    /// Bytes hashed to pick the queue, normally the object name
    fn shard_key(&self) -> &[u8];
}

impl ShardKey for String {
    fn shard_key(&self) -> &[u8] {
        self.as_bytes()
    }
}

/// Queue index for `key` among `queues` queues
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn shard_index(key: &[u8], queues: usize) -> usize {
    if queues <= 1 {
        return 0;
    }
    (xxhash_rust::xxh64::xxh64(key, 0) % queues as u64) as usize
}

/// Work done for each dequeued item
pub trait OpProcessor<T>: Send + Sync + 'static {
    /// Process one item on worker `worker`
    fn process(&self, worker: usize, item: &mut T) -> Result<()>;

    /// Deliver the outcome. Called exactly once per dequeued item, including
    /// when [`process`](Self::process) failed or panicked.
    fn complete(&self, item: T, result: Result<()>);
}

/// Sizing and placement of a worker pool
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Thread name prefix
    pub name: String,
    pub queues: usize,
    /// Per-queue soft capacity
    pub capacity: usize,
    /// Cores to pin workers to, cycled by queue index. Empty disables pinning.
    pub cores: Vec<usize>,
}

impl WorkerPoolConfig {
    pub fn new(name: impl Into<String>, queues: usize, capacity: usize) -> Self {
        Self {
            name: name.into(),
            queues,
            capacity,
            cores: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_cores(mut self, cores: Vec<usize>) -> Self {
        self.cores = cores;
        self
    }
}

/// Fixed set of queues, one worker thread each
pub struct WorkerPool<T> {
    name: String,
    queues: Vec<Arc<BoundedQueue<T>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    stats: Arc<DispatchStats>,
    stopped: AtomicBool,
}

impl<T: ShardKey + Send + 'static> WorkerPool<T> {
    /// Create the queues and spawn one worker per queue
    pub fn start(config: &WorkerPoolConfig, processor: Arc<dyn OpProcessor<T>>) -> Result<Self> {
        if config.queues == 0 {
            return Err(Error::invalid_argument("worker pool needs at least one queue"));
        }
        if config.capacity == 0 {
            return Err(Error::invalid_argument("queue capacity must be positive"));
        }

        let stats = Arc::new(DispatchStats::new());
        let queues: Vec<Arc<BoundedQueue<T>>> = (0..config.queues)
            .map(|_| Arc::new(BoundedQueue::new(config.capacity)))
            .collect();

        let pool = Self {
            name: config.name.clone(),
            queues,
            workers: Mutex::new(Vec::with_capacity(config.queues)),
            stats,
            stopped: AtomicBool::new(false),
        };

        for (index, queue) in pool.queues.iter().enumerate() {
            let queue = Arc::clone(queue);
            let processor = Arc::clone(&processor);
            let stats = Arc::clone(&pool.stats);
            let core = affinity::core_for(&config.cores, index);
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", config.name, index))
                .spawn(move || worker_loop(index, core, &queue, processor.as_ref(), &stats));
            match spawned {
                Ok(handle) => pool.workers.lock().push(handle),
                Err(e) => {
                    error!("Spawn worker {} of {} failed: {}", index, config.name, e);
                    pool.stop_all();
                    return Err(e.into());
                }
            }
        }

        info!(
            "Started {} workers for {} (capacity {}, cores {:?})",
            config.queues, config.name, config.capacity, config.cores
        );
        Ok(pool)
    }

    /// Queue an item routes to
    pub fn queue_index(&self, item: &T) -> usize {
        shard_index(item.shard_key(), self.queues.len())
    }

    /// Route and queue `item`, blocking while its queue is full. After
    /// [`stop_all`](Self::stop_all) the item is handed back.
    pub fn enqueue(&self, item: T) -> std::result::Result<(), ShutdownError<T>> {
        let index = self.queue_index(&item);
        match self.queues[index].push(item) {
            Ok(()) => {
                self.stats.record_enqueued();
                Ok(())
            }
            Err(rejected) => {
                self.stats.record_rejected();
                debug!("{} queue {} rejected item after shutdown", self.name, index);
                Err(rejected)
            }
        }
    }
}

impl<T> WorkerPool<T> {
    /// Finish every queue and join every worker. Items already queued are
    /// processed first. Only the first call has any effect.
    pub fn stop_all(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        for queue in &self.queues {
            queue.finish();
        }
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let count = workers.len();
        for handle in workers {
            if handle.join().is_err() {
                error!("{} worker thread panicked", self.name);
            }
        }
        info!("Stopped {} workers for {}", count, self.name);
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Pending items per queue
    pub fn queue_depths(&self) -> Vec<usize> {
        self.queues.iter().map(|q| q.len()).collect()
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        &self.stats
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl<T> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn worker_loop<T: 'static>(
    worker: usize,
    core: Option<usize>,
    queue: &BoundedQueue<T>,
    processor: &dyn OpProcessor<T>,
    stats: &DispatchStats,
) {
    if let Some(core) = core {
        match affinity::pin_current_thread(core) {
            Ok(()) => debug!("Worker {} pinned to core {}", worker, core),
            Err(e) => warn!("Pin worker {} to core {} failed: {}", worker, core, e),
        }
    }

    let mut batch = VecDeque::new();
    while queue.drain_swap(&mut batch) {
        stats.record_batch();
        for pending in batch.drain(..) {
            stats.queue_wait.record_duration(pending.enqueued_at.elapsed());
            let mut item = pending.item;

            let result = catch_unwind(AssertUnwindSafe(|| processor.process(worker, &mut item)))
                .unwrap_or_else(|_| {
                    error!("Worker {} panicked while processing an item", worker);
                    Err(Error::internal("panic while processing request"))
                });
            stats.record_result(result.is_ok());

            if catch_unwind(AssertUnwindSafe(|| processor.complete(item, result))).is_err() {
                error!("Worker {} panicked while completing an item", worker);
            }
            stats.op_life.record_duration(Instant::now() - pending.period_start);
        }
    }
    debug!("Worker {} exiting", worker);
}
