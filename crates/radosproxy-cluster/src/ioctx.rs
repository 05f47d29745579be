//! Pool context table
//!
//! Caches one opened [`IoCtx`] per pool key. Lookups take the shared lock;
//! a miss re-checks and creates under the exclusive lock, so concurrent
//! callers for the same key never open two handles.

use crate::client::{ClusterClient, IoCtx};
use parking_lot::RwLock;
use radosproxy_common::{PoolKey, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Cache of opened pool contexts
#[derive(Default)]
pub struct IoCtxTable {
    entries: RwLock<HashMap<PoolKey, Arc<dyn IoCtx>>>,
}

impl IoCtxTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached context for `key`, if any
    pub fn get(&self, key: &PoolKey) -> Option<Arc<dyn IoCtx>> {
        self.entries.read().get(key).cloned()
    }

    /// Return the cached context for `key`, creating it with `create` on a
    /// miss. A failed creation is not cached and its error is returned as is.
    pub fn get_or_create<F>(&self, key: &PoolKey, create: F) -> Result<Arc<dyn IoCtx>>
    where
        F: FnOnce(&PoolKey) -> Result<Arc<dyn IoCtx>>,
    {
        key.validate()?;

        if let Some(ctx) = self.entries.read().get(key) {
            return Ok(Arc::clone(ctx));
        }

        let mut entries = self.entries.write();
        if let Some(ctx) = entries.get(key) {
            return Ok(Arc::clone(ctx));
        }

        let ctx = create(key).map_err(|e| {
            error!("Create IoCtx for pool {} failed: {}", key, e);
            e
        })?;
        entries.insert(key.clone(), Arc::clone(&ctx));
        debug!("Cached IoCtx for pool {} (id {})", key, ctx.pool_id());
        Ok(ctx)
    }

    /// [`get_or_create`](Self::get_or_create) backed by the cluster client's
    /// context-creation calls
    pub fn get_or_open(&self, client: &dyn ClusterClient, key: &PoolKey) -> Result<Arc<dyn IoCtx>> {
        self.get_or_create(key, |key| match key {
            PoolKey::Name(name) => client.ioctx_create(name),
            PoolKey::Id(id) => client.ioctx_create_by_id(*id),
        })
    }

    /// Close every cached context and empty the table. Safe to call again.
    pub fn clear_all(&self) {
        let drained: Vec<(PoolKey, Arc<dyn IoCtx>)> = self.entries.write().drain().collect();
        if drained.is_empty() {
            return;
        }
        for (key, ctx) in &drained {
            debug!("Closing IoCtx for pool {}", key);
            ctx.close();
        }
        info!("Closed {} cached pool contexts", drained.len());
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemCluster;
    use radosproxy_common::Error;
    use std::sync::Barrier;
    use std::thread;

    fn cluster() -> Arc<MemCluster> {
        let cluster = Arc::new(MemCluster::new());
        cluster.create_pool("rbd", 3).unwrap();
        cluster.create_pool("cache", 2).unwrap();
        cluster
    }

    #[test]
    fn test_hit_returns_same_handle() {
        let cluster = cluster();
        let table = IoCtxTable::new();
        let key = PoolKey::Name("rbd".into());
        let a = table.get_or_open(cluster.as_ref(), &key).unwrap();
        let b = table.get_or_open(cluster.as_ref(), &key).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cluster.ioctx_create_calls(), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_name_and_id_keys_are_distinct() {
        let cluster = cluster();
        let table = IoCtxTable::new();
        let by_name = table.get_or_open(cluster.as_ref(), &PoolKey::Name("rbd".into())).unwrap();
        let by_id = table.get_or_open(cluster.as_ref(), &PoolKey::Id(by_name.pool_id())).unwrap();
        assert_eq!(by_name.pool_id(), by_id.pool_id());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_failure_is_not_cached() {
        let cluster = cluster();
        let table = IoCtxTable::new();
        let key = PoolKey::Name("later".into());
        let err = table.get_or_open(cluster.as_ref(), &key).err().unwrap();
        assert!(err.is_not_found());
        assert!(table.is_empty());

        cluster.create_pool("later", 3).unwrap();
        assert!(table.get_or_open(cluster.as_ref(), &key).is_ok());
        assert_eq!(cluster.ioctx_create_calls(), 2);
    }

    #[test]
    fn test_invalid_keys_rejected_without_cluster_call() {
        let cluster = cluster();
        let table = IoCtxTable::new();
        let err = table
            .get_or_open(cluster.as_ref(), &PoolKey::Name(String::new()))
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(table.get_or_open(cluster.as_ref(), &PoolKey::Id(0)).is_err());
        assert_eq!(cluster.ioctx_create_calls(), 0);
    }

    #[test]
    fn test_concurrent_miss_creates_once() {
        let cluster = cluster();
        let table = Arc::new(IoCtxTable::new());
        let barrier = Arc::new(Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cluster = cluster.clone();
                let table = table.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    table
                        .get_or_open(cluster.as_ref(), &PoolKey::Name("cache".into()))
                        .unwrap()
                })
            })
            .collect();
        let ctxs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(cluster.ioctx_create_calls(), 1);
        assert!(ctxs.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn test_clear_all_closes_and_is_idempotent() {
        let cluster = cluster();
        let table = IoCtxTable::new();
        table.get_or_open(cluster.as_ref(), &PoolKey::Name("rbd".into())).unwrap();
        table.get_or_open(cluster.as_ref(), &PoolKey::Name("cache".into())).unwrap();
        table.clear_all();
        assert!(table.is_empty());
        assert_eq!(cluster.ioctx_close_calls(), 2);
        table.clear_all();
        assert_eq!(cluster.ioctx_close_calls(), 2);
    }
}
