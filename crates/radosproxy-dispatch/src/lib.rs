//! RadosProxy worker dispatch
//!
//! Requests are sharded by object name onto a fixed set of bounded queues.
//! Each queue has one worker thread that swaps out the whole pending batch
//! under the queue lock and processes it without holding any lock. Producers
//! block while a queue is at capacity.

pub mod affinity;
pub mod engine;
pub mod perf;
pub mod queue;

pub use engine::{OpProcessor, ShardKey, WorkerPool, WorkerPoolConfig, shard_index};
pub use perf::{DispatchSnapshot, DispatchStats, LatencyHistogram, PerfReporter};
pub use queue::{BoundedQueue, Pending, ShutdownError};
