//! Completion callbacks for queued op batches

use crate::op::ReadOpOutput;
use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use std::fmt;
use std::time::Duration;

type Callback = Box<dyn FnOnce(i32, ReadOpOutput) + Send + 'static>;

/// One-shot completion. The status is 0 on success or a negative errno;
/// write batches complete with an empty output.
pub struct Completion {
    callback: Callback,
}

impl Completion {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(i32, ReadOpOutput) + Send + 'static,
    {
        Self {
            callback: Box::new(callback),
        }
    }

    /// A completion paired with a waiter for synchronous callers
    #[must_use]
    pub fn channel() -> (Self, CompletionWaiter) {
        let (tx, rx) = bounded(1);
        let completion = Self::new(move |rc, out| {
            // The waiter may have been dropped; nobody is listening then.
            let _ = tx.send((rc, out));
        });
        (completion, CompletionWaiter { rx })
    }

    /// Fire the callback
    pub fn complete(self, rc: i32, output: ReadOpOutput) {
        (self.callback)(rc, output);
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}

/// Receiving side of [`Completion::channel`]
#[derive(Debug)]
pub struct CompletionWaiter {
    rx: Receiver<(i32, ReadOpOutput)>,
}

impl CompletionWaiter {
    /// Block until the completion fires. Returns `-ECANCELED` if the
    /// completion was dropped without firing.
    #[must_use]
    pub fn wait(self) -> (i32, ReadOpOutput) {
        self.rx
            .recv()
            .unwrap_or((-libc::ECANCELED, ReadOpOutput::default()))
    }

    /// Block for at most `timeout`
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> Option<(i32, ReadOpOutput)> {
        match self.rx.recv_timeout(timeout) {
            Ok(v) => Some(v),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                Some((-libc::ECANCELED, ReadOpOutput::default()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn test_callback_receives_status() {
        let seen = Arc::new(AtomicI32::new(1));
        let s = seen.clone();
        let c = Completion::new(move |rc, _| s.store(rc, Ordering::SeqCst));
        c.complete(-5, ReadOpOutput::default());
        assert_eq!(seen.load(Ordering::SeqCst), -5);
    }

    #[test]
    fn test_channel_wait() {
        let (c, waiter) = Completion::channel();
        std::thread::spawn(move || c.complete(0, ReadOpOutput::default()));
        let (rc, out) = waiter.wait();
        assert_eq!(rc, 0);
        assert!(out.results.is_empty());
    }

    #[test]
    fn test_dropped_completion_cancels() {
        let (c, waiter) = Completion::channel();
        assert!(waiter.wait_timeout(Duration::from_millis(10)).is_none());
        drop(c);
        assert_eq!(waiter.wait().0, -libc::ECANCELED);
    }
}
