//! Reference-counted cluster client handle
//!
//! One [`ClientHandle`] owns the long-lived connection to the cluster.
//! Every user holds a [`ClientRef`]; the connection is established by the
//! first acquirer and torn down when the last reference drops.

use crate::client::ClusterClient;
use parking_lot::RwLock;
use radosproxy_common::{Error, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Connect retry schedule
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total connect attempts
    pub attempts: u32,
    /// Backoff unit; attempt `n` failing waits `base_delay * 2^n`
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th (1-based) failed attempt
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay
            .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
            .unwrap_or(Duration::MAX)
    }
}

/// Lifecycle of the underlying connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Uninitialized = 0,
    Connecting = 1,
    Connected = 2,
    ShutDown = 3,
}

impl ConnectionState {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::ShutDown,
            _ => Self::Uninitialized,
        }
    }
}

/// Shared owner of the cluster connection
pub struct ClientHandle {
    client: Arc<dyn ClusterClient>,
    retry: RetryPolicy,
    /// Guards connect and teardown. Acquirers of a live connection only
    /// need the shared side.
    lock: RwLock<()>,
    state: AtomicU8,
    refs: AtomicUsize,
    conf_path: RwLock<Option<PathBuf>>,
}

impl ClientHandle {
    pub fn new(client: Arc<dyn ClusterClient>, retry: RetryPolicy) -> Arc<Self> {
        Arc::new(Self {
            client,
            retry,
            lock: RwLock::new(()),
            state: AtomicU8::new(ConnectionState::Uninitialized as u8),
            refs: AtomicUsize::new(0),
            conf_path: RwLock::new(None),
        })
    }

    /// Take a reference to the connection, connecting first if nobody holds
    /// one. Options are applied before connecting; on an already live
    /// connection they are applied best-effort.
    pub fn acquire(
        self: &Arc<Self>,
        conf_path: &Path,
        options: &[(String, String)],
    ) -> Result<ClientRef> {
        {
            let _shared = self.lock.read();
            if self.state() == ConnectionState::Connected {
                self.refs.fetch_add(1, Ordering::AcqRel);
                self.apply_options_best_effort(options);
                return Ok(ClientRef {
                    handle: Arc::clone(self),
                });
            }
        }

        let _exclusive = self.lock.write();
        if self.state() == ConnectionState::Connected {
            self.refs.fetch_add(1, Ordering::AcqRel);
            self.apply_options_best_effort(options);
            return Ok(ClientRef {
                handle: Arc::clone(self),
            });
        }

        self.set_state(ConnectionState::Connecting);
        if let Err(e) = self.connect_locked(conf_path, options) {
            self.set_state(ConnectionState::ShutDown);
            return Err(e);
        }

        self.refs.store(1, Ordering::Release);
        *self.conf_path.write() = Some(conf_path.to_path_buf());
        self.set_state(ConnectionState::Connected);
        info!("Cluster client connected (conf {})", conf_path.display());
        Ok(ClientRef {
            handle: Arc::clone(self),
        })
    }

    fn connect_locked(&self, conf_path: &Path, options: &[(String, String)]) -> Result<()> {
        if let Err(e) = self.client.conf_read_file(conf_path) {
            error!("Failed to read cluster conf {}: {}", conf_path.display(), e);
            self.client.shutdown();
            return Err(e);
        }

        for (key, value) in options {
            if let Err(e) = self.client.conf_set(key, value) {
                error!("Failed to set cluster option {}={}: {}", key, value, e);
                self.client.shutdown();
                return Err(e);
            }
            debug!("Cluster option {}={}", key, value);
        }

        let attempts = self.retry.attempts.max(1);
        let mut last_code = -libc::ENOTCONN;
        for attempt in 1..=attempts {
            match self.client.connect() {
                Ok(()) => return Ok(()),
                Err(e) => {
                    last_code = e.errno();
                    warn!(
                        "Connect to cluster monitor failed: {}, retry [{}/{}]",
                        e, attempt, attempts
                    );
                    if attempt < attempts {
                        std::thread::sleep(self.retry.delay_after(attempt));
                    }
                }
            }
        }

        error!("Cluster connect gave up after {} attempts", attempts);
        self.client.shutdown();
        Err(Error::ConnectFailed {
            attempts,
            code: last_code,
        })
    }

    fn apply_options_best_effort(&self, options: &[(String, String)]) {
        for (key, value) in options {
            if let Err(e) = self.client.conf_set(key, value) {
                warn!("Failed to set cluster option {}={}: {}", key, value, e);
            }
        }
    }

    fn release(&self) {
        let _exclusive = self.lock.write();
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 {
            self.client.shutdown();
            self.set_state(ConnectionState::ShutDown);
            info!("Cluster client shut down");
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Number of live references
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Conf file used by the live connection
    pub fn conf_path(&self) -> Option<PathBuf> {
        self.conf_path.read().clone()
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("state", &self.state())
            .field("refs", &self.ref_count())
            .finish_non_exhaustive()
    }
}

/// A live reference to the cluster connection. Dropping the last one shuts
/// the connection down.
pub struct ClientRef {
    handle: Arc<ClientHandle>,
}

impl ClientRef {
    /// The connected cluster client
    pub fn client(&self) -> &Arc<dyn ClusterClient> {
        &self.handle.client
    }

    pub fn handle(&self) -> &Arc<ClientHandle> {
        &self.handle
    }
}

impl Clone for ClientRef {
    fn clone(&self) -> Self {
        let _shared = self.handle.lock.read();
        self.handle.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            handle: Arc::clone(&self.handle),
        }
    }
}

impl Drop for ClientRef {
    fn drop(&mut self) {
        self.handle.release();
    }
}

impl fmt::Debug for ClientRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRef")
            .field("handle", &self.handle)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemCluster;
    use std::thread;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_retry_delay_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(10));
        assert_eq!(policy.delay_after(2), Duration::from_secs(20));
        assert_eq!(policy.delay_after(4), Duration::from_secs(80));
    }

    #[test]
    fn test_first_acquire_connects_once() {
        let cluster = Arc::new(MemCluster::new());
        let handle = ClientHandle::new(cluster.clone(), fast_retry());
        assert_eq!(handle.state(), ConnectionState::Uninitialized);

        let a = handle.acquire(Path::new("/etc/ceph/ceph.conf"), &[]).unwrap();
        let b = handle.acquire(Path::new("/etc/ceph/ceph.conf"), &[]).unwrap();
        assert_eq!(cluster.connect_calls(), 1);
        assert_eq!(handle.ref_count(), 2);
        assert_eq!(handle.state(), ConnectionState::Connected);

        drop(a);
        assert_eq!(handle.state(), ConnectionState::Connected);
        assert_eq!(cluster.shutdown_calls(), 0);
        drop(b);
        assert_eq!(handle.state(), ConnectionState::ShutDown);
        assert_eq!(cluster.shutdown_calls(), 1);
    }

    #[test]
    fn test_reacquire_after_shutdown_reconnects() {
        let cluster = Arc::new(MemCluster::new());
        let handle = ClientHandle::new(cluster.clone(), fast_retry());
        drop(handle.acquire(Path::new("c"), &[]).unwrap());
        let _again = handle.acquire(Path::new("c"), &[]).unwrap();
        assert_eq!(cluster.connect_calls(), 2);
        assert_eq!(handle.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_connect_retries_then_succeeds() {
        let cluster = Arc::new(MemCluster::new());
        cluster.fail_next_connects(2);
        let handle = ClientHandle::new(cluster.clone(), fast_retry());
        let _r = handle.acquire(Path::new("c"), &[]).unwrap();
        assert_eq!(cluster.connect_calls(), 3);
    }

    #[test]
    fn test_connect_gives_up() {
        let cluster = Arc::new(MemCluster::new());
        cluster.fail_next_connects(10);
        let handle = ClientHandle::new(cluster.clone(), fast_retry());
        let err = handle.acquire(Path::new("c"), &[]).unwrap_err();
        assert!(matches!(err, Error::ConnectFailed { attempts: 3, .. }));
        assert_eq!(cluster.connect_calls(), 3);
        assert_eq!(handle.state(), ConnectionState::ShutDown);
        assert_eq!(handle.ref_count(), 0);
    }

    #[test]
    fn test_options_applied_before_connect() {
        let cluster = Arc::new(MemCluster::new());
        let handle = ClientHandle::new(cluster.clone(), fast_retry());
        let opts = vec![("rados_osd_op_timeout".to_string(), "30".to_string())];
        let r = handle.acquire(Path::new("c"), &opts).unwrap();
        assert_eq!(r.client().conf_get("rados_osd_op_timeout").unwrap(), "30");
    }

    #[test]
    fn test_concurrent_acquire_single_connect() {
        let cluster = Arc::new(MemCluster::new());
        let handle = ClientHandle::new(cluster.clone(), fast_retry());
        let refs: Vec<ClientRef> = (0..8)
            .map(|_| {
                let h = handle.clone();
                thread::spawn(move || h.acquire(Path::new("c"), &[]).unwrap())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|t| t.join().unwrap())
            .collect();
        assert_eq!(cluster.connect_calls(), 1);
        assert_eq!(handle.ref_count(), 8);
        let cloned = refs[0].clone();
        assert_eq!(handle.ref_count(), 9);
        drop(refs);
        assert_eq!(handle.state(), ConnectionState::Connected);
        drop(cloned);
        assert_eq!(handle.state(), ConnectionState::ShutDown);
    }
}
