//! Pool event notification
//!
//! Holds at most one observer per [`PoolEvent`]. Registration is one-shot:
//! a second registration fails and keeps the first observer.

use parking_lot::RwLock;
use radosproxy_common::{Error, PoolEvent, PoolId, Result};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Receives one call per affected pool. Returns 0 on success.
pub trait PoolEventObserver: Send + Sync {
    fn notify(&self, pool: PoolId) -> i32;
}

impl<F> PoolEventObserver for F
where
    F: Fn(PoolId) -> i32 + Send + Sync,
{
    fn notify(&self, pool: PoolId) -> i32 {
        self(pool)
    }
}

type Slot = RwLock<Option<Arc<dyn PoolEventObserver>>>;

/// Create/delete observer registry
#[derive(Default)]
pub struct PoolEventNotifier {
    created: Slot,
    deleted: Slot,
}

impl PoolEventNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    const fn slot(&self, event: PoolEvent) -> &Slot {
        match event {
            PoolEvent::Created => &self.created,
            PoolEvent::Deleted => &self.deleted,
        }
    }

    /// Register the observer for `event`
    pub fn register(&self, event: PoolEvent, observer: Arc<dyn PoolEventObserver>) -> Result<()> {
        let mut slot = self.slot(event).write();
        if slot.is_some() {
            error!("Pool {} observer already registered", event);
            return Err(Error::AlreadyRegistered(event));
        }
        *slot = Some(observer);
        info!("Registered pool {} observer", event);
        Ok(())
    }

    pub fn is_registered(&self, event: PoolEvent) -> bool {
        self.slot(event).read().is_some()
    }

    /// Notify the observer for `event` once per pool. Every pool is
    /// attempted; the ids whose notification failed are returned in
    /// [`Error::PoolNotify`]. Without an observer this is a no-op.
    pub fn report(&self, event: PoolEvent, pools: &[PoolId]) -> Result<()> {
        if pools.is_empty() {
            return Ok(());
        }
        let Some(observer) = self.slot(event).read().clone() else {
            debug!("No pool {} observer, dropping {} events", event, pools.len());
            return Ok(());
        };

        let failed: Vec<PoolId> = pools
            .iter()
            .copied()
            .filter(|&pool| {
                let rc = observer.notify(pool);
                if rc != 0 {
                    error!("Notify pool {} {} failed: {}", pool, event, rc);
                }
                rc != 0
            })
            .collect();

        if failed.is_empty() {
            debug!("Notified pool {} for {:?}", event, pools);
            Ok(())
        } else {
            Err(Error::PoolNotify { event, failed })
        }
    }

    pub fn report_created(&self, pools: &[PoolId]) -> Result<()> {
        self.report(PoolEvent::Created, pools)
    }

    pub fn report_deleted(&self, pools: &[PoolId]) -> Result<()> {
        self.report(PoolEvent::Deleted, pools)
    }
}
