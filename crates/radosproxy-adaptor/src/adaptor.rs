//! Server adaptor: queues inbound requests onto per-object workers

use crate::handler::OpHandler;
use crate::processor::{AdaptorProcessor, InboundOp};
use parking_lot::Mutex;
use radosproxy_common::config::{MessengerSection, WorkerSection};
use radosproxy_common::Result;
use radosproxy_dispatch::{DispatchStats, PerfReporter, WorkerPool, WorkerPoolConfig, affinity};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Worker layout of the adaptor
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdaptorConfig {
    pub queues: usize,
    pub capacity: usize,
    /// Cores for the adaptor workers; empty disables pinning
    pub cores: Vec<usize>,
    /// Periodic perf log interval, if enabled
    pub perf_interval: Option<Duration>,
}

impl AdaptorConfig {
    /// Build from the messenger and worker sections. With core binding on,
    /// the first `msgr_amount + ports` cores are left to the messenger.
    #[must_use]
    pub fn from_sections(messenger: &MessengerSection, worker: &WorkerSection) -> Self {
        let cores = if messenger.bind_queue_core {
            affinity::worker_cores(
                &worker.core_list,
                worker.msgr_amount + messenger.listen_ports.len(),
            )
        } else {
            Vec::new()
        };
        Self {
            queues: messenger.queue_amount,
            capacity: messenger.queue_max_capacity,
            cores,
            perf_interval: messenger
                .perf
                .then(|| Duration::from_secs(messenger.perf_interval_secs.max(1))),
        }
    }
}

/// Owns the adaptor worker pool
pub struct ServerAdaptor {
    pool: WorkerPool<InboundOp>,
    perf: Mutex<Option<PerfReporter>>,
}

impl ServerAdaptor {
    /// Start the workers. Requests are handed to `handler` after
    /// normalisation.
    pub fn start(config: &AdaptorConfig, handler: Arc<dyn OpHandler>) -> Result<Self> {
        let pool_config = WorkerPoolConfig::new("sa-worker", config.queues, config.capacity)
            .with_cores(config.cores.clone());
        let pool = WorkerPool::start(&pool_config, Arc::new(AdaptorProcessor::new(handler)))?;

        let perf = match config.perf_interval {
            Some(interval) => match PerfReporter::start("sa", Arc::clone(pool.stats()), interval) {
                Ok(reporter) => {
                    warn!("Server adaptor perf reporting on, every {:?}", interval);
                    Some(reporter)
                }
                Err(e) => {
                    warn!("Start perf reporter failed: {}", e);
                    None
                }
            },
            None => None,
        };

        info!(
            "Server adaptor started: {} queues, capacity {}",
            config.queues, config.capacity
        );
        Ok(Self {
            pool,
            perf: Mutex::new(perf),
        })
    }

    /// Queue `op` on its object's worker, blocking while that queue is full.
    /// After [`stop`](Self::stop) the request is answered with `-ESHUTDOWN`.
    pub fn enqueue(&self, op: InboundOp) {
        if let Err(rejected) = self.pool.enqueue(op) {
            let op = rejected.into_inner();
            warn!(
                "Adaptor stopped, rejecting {} from {}",
                op.request.tid,
                op.conn.peer()
            );
            op.reply_status(-libc::ESHUTDOWN);
        }
    }

    /// Stop the workers after they drain their queues. Idempotent.
    pub fn stop(&self) {
        if let Some(perf) = self.perf.lock().take() {
            perf.stop();
        }
        self.pool.stop_all();
    }

    pub fn stats(&self) -> &Arc<DispatchStats> {
        self.pool.stats()
    }

    pub fn queue_depths(&self) -> Vec<usize> {
        self.pool.queue_depths()
    }

    pub fn is_stopped(&self) -> bool {
        self.pool.is_stopped()
    }
}

impl Drop for ServerAdaptor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Connection;
    use crate::request::{NOSNAP, OpRequest};
    use crate::wire::{ClientOp, ClientRequest, OpOutput, OpReply};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Conn {
        replies: Mutex<Vec<OpReply>>,
    }

    impl Connection for Conn {
        fn send_reply(&self, reply: OpReply) -> Result<()> {
            self.replies.lock().push(reply);
            Ok(())
        }

        fn peer(&self) -> String {
            "conn".to_string()
        }
    }

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
    }

    impl OpHandler for CountingHandler {
        fn handle(&self, _worker: usize, _request: &OpRequest, _outputs: &mut [OpOutput]) -> i32 {
            self.calls.fetch_add(1, Ordering::SeqCst);
            0
        }
    }

    fn op(tid: u64, object: &str, conn: &Arc<Conn>) -> InboundOp {
        let conn: Arc<dyn Connection> = conn.clone();
        InboundOp::new(
            ClientRequest {
                tid,
                pool_id: 1,
                pg_seed: 0,
                snap_id: NOSNAP,
                object: object.to_string(),
                ops: vec![ClientOp::stat()],
            },
            conn,
        )
    }

    fn config(queues: usize) -> AdaptorConfig {
        AdaptorConfig {
            queues,
            capacity: 16,
            cores: Vec::new(),
            perf_interval: None,
        }
    }

    #[test]
    fn test_every_request_answered() {
        let handler = Arc::new(CountingHandler::default());
        let adaptor = ServerAdaptor::start(&config(3), handler.clone()).unwrap();
        let conn = Arc::new(Conn::default());
        for tid in 0..40 {
            adaptor.enqueue(op(tid, &format!("obj-{}", tid % 7), &conn));
        }
        adaptor.stop();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 40);
        let mut tids: Vec<u64> = conn.replies.lock().iter().map(|r| r.tid).collect();
        tids.sort_unstable();
        assert_eq!(tids, (0..40).collect::<Vec<_>>());
        assert_eq!(adaptor.stats().completed(), 40);
    }

    #[test]
    fn test_enqueue_after_stop_replies_shutdown() {
        let handler = Arc::new(CountingHandler::default());
        let adaptor = ServerAdaptor::start(&config(1), handler.clone()).unwrap();
        adaptor.stop();
        assert!(adaptor.is_stopped());

        let conn = Arc::new(Conn::default());
        adaptor.enqueue(op(77, "late", &conn));
        let replies = conn.replies.lock();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].tid, 77);
        assert_eq!(replies[0].result, -libc::ESHUTDOWN);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        adaptor.stop();
    }

    #[test]
    fn test_config_reserves_messenger_cores() {
        let messenger = MessengerSection {
            bind_queue_core: true,
            listen_ports: vec!["1234".into(), "1235".into()],
            queue_amount: 2,
            perf: true,
            ..MessengerSection::default()
        };
        let worker = WorkerSection {
            core_list: vec![1, 2, 3, 4, 5, 6, 7],
            msgr_amount: 3,
            ..WorkerSection::default()
        };
        let config = AdaptorConfig::from_sections(&messenger, &worker);
        assert_eq!(config.cores, vec![6, 7]);
        assert_eq!(config.queues, 2);
        assert_eq!(config.perf_interval, Some(Duration::from_secs(3)));

        let unbound = AdaptorConfig::from_sections(&MessengerSection::default(), &worker);
        assert!(unbound.cores.is_empty());
        assert_eq!(unbound.perf_interval, None);
    }
}
