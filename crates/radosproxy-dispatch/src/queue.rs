//! Bounded FIFO with drain-swap
//!
//! Producers call [`BoundedQueue::push`] and block while the queue holds
//! `capacity` or more items. The single consumer calls
//! [`BoundedQueue::drain_swap`], which swaps the entire pending collection
//! into its own buffer in one step and wakes blocked producers. The lock is
//! therefore held for a constant amount of work regardless of batch size.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

const FULL_WARN_INTERVAL: Duration = Duration::from_secs(1);

/// A queued item with its timestamps
#[derive(Debug)]
pub struct Pending<T> {
    pub item: T,
    /// When the item entered the queue
    pub enqueued_at: Instant,
    /// When the producer offered the item, before any back-pressure wait
    pub period_start: Instant,
}

/// Returned by [`BoundedQueue::push`] after the queue was finished. Carries
/// the rejected item back to the caller.
pub struct ShutdownError<T>(pub T);

impl<T> ShutdownError<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for ShutdownError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ShutdownError(..)")
    }
}

impl<T> fmt::Display for ShutdownError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("queue is shut down")
    }
}

impl<T> std::error::Error for ShutdownError<T> {}

struct State<T> {
    items: VecDeque<Pending<T>>,
    finished: bool,
    last_full_warn: Option<Instant>,
}

/// Bounded multi-producer, single-consumer queue
pub struct BoundedQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
    full_waits: AtomicU64,
}

impl<T> BoundedQueue<T> {
    /// Queue that applies back-pressure at `capacity` items (at least one)
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                finished: false,
                last_full_warn: None,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
            full_waits: AtomicU64::new(0),
        }
    }

    /// Append `item`, blocking while the queue is full. Fails only once the
    /// queue is finished, handing the item back.
    pub fn push(&self, item: T) -> Result<(), ShutdownError<T>> {
        let period_start = Instant::now();
        let mut state = self.state.lock();
        if !state.finished && state.items.len() >= self.capacity {
            self.full_waits.fetch_add(1, Ordering::Relaxed);
            let now = Instant::now();
            if state
                .last_full_warn
                .is_none_or(|t| now.duration_since(t) >= FULL_WARN_INTERVAL)
            {
                state.last_full_warn = Some(now);
                warn!(
                    "Queue full ({} items, capacity {}), producer waiting",
                    state.items.len(),
                    self.capacity
                );
            }
            while !state.finished && state.items.len() >= self.capacity {
                self.not_full.wait(&mut state);
            }
        }
        if state.finished {
            return Err(ShutdownError(item));
        }
        state.items.push_back(Pending {
            item,
            enqueued_at: Instant::now(),
            period_start,
        });
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Block until items are pending or the queue is finished, then swap all
    /// pending items into `batch`. Returns false once the queue is finished
    /// and empty. Items queued before [`finish`](Self::finish) are still
    /// handed out.
    pub fn drain_swap(&self, batch: &mut VecDeque<Pending<T>>) -> bool {
        debug_assert!(batch.is_empty());
        let mut state = self.state.lock();
        while state.items.is_empty() && !state.finished {
            self.not_empty.wait(&mut state);
        }
        if state.items.is_empty() {
            return false;
        }
        std::mem::swap(&mut state.items, batch);
        drop(state);
        self.not_full.notify_all();
        true
    }

    /// Reject further pushes and wake every waiter
    pub fn finish(&self) {
        self.state.lock().finished = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pushes that had to wait for room
    pub fn full_waits(&self) -> u64 {
        self.full_waits.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    fn drain(q: &BoundedQueue<u32>) -> Vec<u32> {
        let mut batch = VecDeque::new();
        assert!(q.drain_swap(&mut batch));
        batch.into_iter().map(|p| p.item).collect()
    }

    #[test]
    fn test_fifo_order() {
        let q = BoundedQueue::new(8);
        for i in 0..5 {
            q.push(i).unwrap();
        }
        assert_eq!(drain(&q), vec![0, 1, 2, 3, 4]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_producer_over_capacity_blocks_until_drain() {
        for capacity in [1usize, 3, 16] {
            let q = Arc::new(BoundedQueue::new(capacity));
            for i in 0..capacity {
                q.push(u32::try_from(i).unwrap()).unwrap();
            }
            let done = Arc::new(AtomicBool::new(false));
            let producer = {
                let q = q.clone();
                let done = done.clone();
                thread::spawn(move || {
                    q.push(999).unwrap();
                    done.store(true, Ordering::SeqCst);
                })
            };
            thread::sleep(Duration::from_millis(50));
            assert!(!done.load(Ordering::SeqCst), "capacity {capacity}");
            assert_eq!(q.full_waits(), 1);

            assert_eq!(drain(&q).len(), capacity);
            producer.join().unwrap();
            assert!(done.load(Ordering::SeqCst));
            assert_eq!(drain(&q), vec![999]);
        }
    }

    #[test]
    fn test_finish_wakes_consumer_and_rejects_push() {
        let q = Arc::new(BoundedQueue::<u32>::new(4));
        let consumer = {
            let q = q.clone();
            thread::spawn(move || {
                let mut batch = VecDeque::new();
                q.drain_swap(&mut batch)
            })
        };
        thread::sleep(Duration::from_millis(20));
        q.finish();
        assert!(!consumer.join().unwrap());
        assert_eq!(q.push(7).unwrap_err().into_inner(), 7);
    }

    #[test]
    fn test_finish_releases_blocked_producer() {
        let q = Arc::new(BoundedQueue::new(1));
        q.push(1).unwrap();
        let producer = {
            let q = q.clone();
            thread::spawn(move || q.push(2))
        };
        thread::sleep(Duration::from_millis(20));
        q.finish();
        assert_eq!(producer.join().unwrap().unwrap_err().into_inner(), 2);
    }

    #[test]
    fn test_items_before_finish_still_drained() {
        let q = BoundedQueue::new(4);
        q.push(1).unwrap();
        q.push(2).unwrap();
        q.finish();
        assert_eq!(drain(&q), vec![1, 2]);
        let mut batch = VecDeque::new();
        assert!(!q.drain_swap(&mut batch));
    }

    #[test]
    fn test_timestamps_ordered() {
        let q = BoundedQueue::new(2);
        q.push(1).unwrap();
        let mut batch = VecDeque::new();
        q.drain_swap(&mut batch);
        let p = &batch[0];
        assert!(p.period_start <= p.enqueued_at);
    }
}
