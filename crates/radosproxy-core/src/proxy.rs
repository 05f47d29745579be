//! Proxy facade
//!
//! Lifecycle: `init` moves the proxy from `Initing` to `Active` after the
//! cluster connection, the proxy workers and the usage monitor are up.
//! `shutdown` tears them down in reverse order and leaves it `Down`.

use crate::ops::{ProxyOp, ProxyOpProcessor};
use crate::snap::SnapshotService;
use parking_lot::RwLock;
use radosproxy_cluster::{ClientHandle, ClientRef, ClusterClient, IoCtx, IoCtxTable, RetryPolicy};
use radosproxy_common::{
    BdevType, ClusterStat, Error, PoolId, PoolKey, PoolStat, PoolUsageInfo, ProxyConfig, Result,
    config::ClusterSection,
};
use radosproxy_dispatch::{DispatchStats, WorkerPool, WorkerPoolConfig, affinity};
use radosproxy_monitor::{ClusterUsageSource, PoolEventObserver, PoolUsageMonitor};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{debug, error, info, warn};

/// Lifecycle state of a [`Proxy`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ProxyState {
    Initing = 0,
    Active = 1,
    Down = 2,
}

impl ProxyState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Initing,
            1 => Self::Active,
            _ => Self::Down,
        }
    }
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initing => write!(f, "initing"),
            Self::Active => write!(f, "active"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// The proxy: one cluster connection, one pool context cache, one worker
/// pool and, when enabled, one usage monitor
pub struct Proxy {
    state: AtomicU8,
    handle: Arc<ClientHandle>,
    client: RwLock<Option<ClientRef>>,
    ioctxs: Arc<IoCtxTable>,
    workers: WorkerPool<ProxyOp>,
    monitor: RwLock<Option<PoolUsageMonitor>>,
    cluster: ClusterSection,
}

impl Proxy {
    /// Connect, start the proxy workers and the usage monitor. A failure at
    /// any step releases what was already started.
    pub fn init(config: &ProxyConfig, client: Arc<dyn ClusterClient>) -> Result<Arc<Self>> {
        let state = AtomicU8::new(ProxyState::Initing as u8);
        let retry = RetryPolicy {
            attempts: config.cluster.connect_retries,
            base_delay: config.cluster.connect_backoff(),
        };
        let handle = ClientHandle::new(client, retry);
        let client_ref = handle
            .acquire(&config.cluster.ceph_conf, &config.cluster.client_options())
            .inspect_err(|e| error!("Cluster client init failed: {}", e))?;

        let ioctxs = Arc::new(IoCtxTable::new());

        let cores = if config.worker.bind_core {
            affinity::worker_cores(&config.worker.core_list, config.worker.msgr_amount)
        } else {
            Vec::new()
        };
        let pool_config = WorkerPoolConfig::new(
            "proxy-worker",
            config.worker.worker_num,
            config.worker.queue_capacity,
        )
        .with_cores(cores);
        let processor = ProxyOpProcessor::new(Arc::clone(client_ref.client()), Arc::clone(&ioctxs));
        let workers = WorkerPool::start(&pool_config, Arc::new(processor))
            .inspect_err(|e| error!("Start proxy workers failed: {}", e))?;

        let monitor = if config.monitor.enabled {
            let source = ClusterUsageSource::new(client_ref.clone(), Arc::clone(&ioctxs));
            let monitor = PoolUsageMonitor::new(Arc::new(source), config.monitor.interval());
            if let Err(e) = monitor.start() {
                error!("Start pool usage monitor failed: {}", e);
                workers.stop_all();
                ioctxs.clear_all();
                return Err(e);
            }
            Some(monitor)
        } else {
            info!("Pool usage monitor disabled");
            None
        };

        state.store(ProxyState::Active as u8, Ordering::Release);
        info!(
            "Proxy active: {} workers, conf {}",
            config.worker.worker_num,
            config.cluster.ceph_conf.display()
        );
        Ok(Arc::new(Self {
            state,
            handle,
            client: RwLock::new(Some(client_ref)),
            ioctxs,
            workers,
            monitor: RwLock::new(monitor),
            cluster: config.cluster.clone(),
        }))
    }

    /// Stop workers, stop the monitor, close cached contexts and release
    /// the connection. Only the first call does anything.
    pub fn shutdown(&self) {
        let prev = self.state.swap(ProxyState::Down as u8, Ordering::AcqRel);
        if ProxyState::from_u8(prev) == ProxyState::Down {
            return;
        }

        self.workers.stop_all();
        if let Some(monitor) = self.monitor.write().take() {
            monitor.stop();
        }
        self.ioctxs.clear_all();
        self.client.write().take();
        info!("Proxy shut down");
    }

    pub fn state(&self) -> ProxyState {
        ProxyState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn client(&self) -> Result<Arc<dyn ClusterClient>> {
        self.client
            .read()
            .as_ref()
            .map(|c| Arc::clone(c.client()))
            .ok_or(Error::NotConnected)
    }

    /// Queue a batch on its object's worker. The completion fires exactly
    /// once: with the batch result, or with `-ESHUTDOWN` when the proxy is
    /// no longer accepting work.
    pub fn queue_op(&self, op: ProxyOp) -> Result<()> {
        if self.state() != ProxyState::Active {
            op.fail(-libc::ESHUTDOWN);
            return Err(Error::Shutdown);
        }
        self.workers.enqueue(op).map_err(|rejected| {
            warn!("Proxy workers stopped, rejecting op");
            rejected.into_inner().fail(-libc::ESHUTDOWN);
            Error::Shutdown
        })
    }

    /// Cached context for the pool named `pool`, opened on first use
    pub fn ioctx(&self, pool: &str) -> Result<Arc<dyn IoCtx>> {
        let client = self.client()?;
        self.ioctxs
            .get_or_open(client.as_ref(), &PoolKey::Name(pool.to_string()))
    }

    /// Cached context for pool `pool`, opened on first use
    pub fn ioctx_by_id(&self, pool: PoolId) -> Result<Arc<dyn IoCtx>> {
        let client = self.client()?;
        self.ioctxs.get_or_open(client.as_ref(), &PoolKey::Id(pool))
    }

    /// A fresh context that bypasses the cache. The caller releases it with
    /// [`release_ioctx`](Self::release_ioctx).
    pub fn ioctx_uncached(&self, pool: PoolId) -> Result<Arc<dyn IoCtx>> {
        PoolKey::Id(pool).validate()?;
        self.client()?.ioctx_create_by_id(pool)
    }

    pub fn release_ioctx(&self, ctx: &Arc<dyn IoCtx>) {
        ctx.close();
    }

    pub fn pool_id_by_name(&self, pool: &str) -> Result<PoolId> {
        PoolKey::Name(pool.to_string()).validate()?;
        let ctx = self
            .client()?
            .ioctx_create(pool)
            .inspect_err(|e| error!("Create IoCtx for pool {} failed: {}", pool, e))?;
        let id = ctx.pool_id();
        ctx.close();
        Ok(id)
    }

    pub fn pool_name_by_id(&self, pool: PoolId) -> Result<String> {
        let ctx = self
            .ioctx_uncached(pool)
            .inspect_err(|e| error!("Create IoCtx for pool {} failed: {}", pool, e))?;
        let name = ctx.pool_name();
        ctx.close();
        Ok(name)
    }

    pub fn pool_id_by_ctx(&self, ctx: &dyn IoCtx) -> PoolId {
        ctx.pool_id()
    }

    pub fn cluster_stat(&self) -> Result<ClusterStat> {
        self.client()?.cluster_stat()
    }

    pub fn pool_stat(&self, ctx: &dyn IoCtx) -> Result<PoolStat> {
        ctx.pool_stat()
    }

    /// Minimum allocation unit of the given device class, from the
    /// cluster's configuration
    pub fn min_alloc_size(&self, kind: BdevType) -> Result<u32> {
        let option = kind.min_alloc_option();
        let value = self.client()?.conf_get(option)?;
        value
            .trim()
            .parse()
            .map_err(|e| Error::parse(format!("{option}={value}: {e}")))
    }

    fn with_monitor<T>(&self, f: impl FnOnce(&PoolUsageMonitor) -> Result<T>) -> Result<T> {
        match self.monitor.read().as_ref() {
            Some(monitor) => f(monitor),
            None => Err(Error::NotSupported("pool usage monitor is not running".into())),
        }
    }

    /// Latest usage recorded for `pool`
    pub fn pool_usage(&self, pool: PoolId) -> Result<PoolUsageInfo> {
        self.with_monitor(|m| m.usage(pool))
    }

    /// Total used bytes across pools and the shared max-avail
    pub fn used_size_and_max_avail(&self) -> Result<(u64, u64)> {
        self.with_monitor(|m| Ok(m.used_and_max_avail()))
    }

    /// Register the pool-create observer; pools already known are reported
    /// to it at the next monitor cycle
    pub fn register_pool_new_notify(&self, observer: Arc<dyn PoolEventObserver>) -> Result<()> {
        self.with_monitor(|m| m.register_create_observer(observer))
    }

    pub fn register_pool_del_notify(&self, observer: Arc<dyn PoolEventObserver>) -> Result<()> {
        self.with_monitor(|m| m.register_delete_observer(observer))
    }

    /// Run one usage monitor cycle now instead of waiting for the interval
    pub fn refresh_pool_usage(&self) -> Result<()> {
        self.with_monitor(|m| m.run_cycle().map(|_| ()))
    }

    /// Pool ids the usage monitor currently tracks
    pub fn tracked_pools(&self) -> Vec<PoolId> {
        self.monitor
            .read()
            .as_ref()
            .map(PoolUsageMonitor::pool_ids)
            .unwrap_or_default()
    }

    /// Snapshot helpers sharing this proxy's connection
    pub fn snapshots(&self) -> SnapshotService {
        SnapshotService::new(Arc::clone(&self.handle), &self.cluster)
    }

    pub fn worker_stats(&self) -> &Arc<DispatchStats> {
        self.workers.stats()
    }

    pub fn queue_depths(&self) -> Vec<usize> {
        self.workers.queue_depths()
    }

    /// Number of cached pool contexts
    pub fn cached_pools(&self) -> usize {
        self.ioctxs.len()
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        debug!("Dropping proxy in state {}", self.state());
        self.shutdown();
    }
}
