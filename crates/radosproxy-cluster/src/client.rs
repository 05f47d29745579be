//! Cluster client seam
//!
//! These traits describe the storage cluster client the proxy drives. A
//! production deployment plugs a native binding in behind them; tests and the
//! standalone server use [`crate::memory::MemCluster`].

use crate::op::{ReadOp, ReadOpOutput, WriteOp};
use radosproxy_common::{ClusterStat, PoolId, PoolStat, Result, SnapId};
use std::path::Path;
use std::sync::Arc;

/// Output of a monitor command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MonCommandOutput {
    /// Command payload (the report body)
    pub outbuf: Vec<u8>,
    /// Human-readable status string
    pub outs: String,
}

impl MonCommandOutput {
    /// Payload as text, replacing invalid UTF-8
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.outbuf).into_owned()
    }
}

/// Cluster-wide client operations
pub trait ClusterClient: Send + Sync {
    /// Read the client configuration file
    fn conf_read_file(&self, path: &Path) -> Result<()>;

    /// Set one client option
    fn conf_set(&self, key: &str, value: &str) -> Result<()>;

    /// Read one client option
    fn conf_get(&self, key: &str) -> Result<String>;

    /// Connect to the cluster monitors
    fn connect(&self) -> Result<()>;

    /// Tear the connection down
    fn shutdown(&self);

    /// Open a pool context by pool name
    fn ioctx_create(&self, pool: &str) -> Result<Arc<dyn IoCtx>>;

    /// Open a pool context by pool id
    fn ioctx_create_by_id(&self, pool: PoolId) -> Result<Arc<dyn IoCtx>>;

    /// Run a JSON-encoded monitor command
    fn mon_command(&self, cmd: &str) -> Result<MonCommandOutput>;

    /// Cluster capacity summary
    fn cluster_stat(&self) -> Result<ClusterStat>;
}

/// Pool-scoped context handle
pub trait IoCtx: Send + Sync {
    fn pool_id(&self) -> PoolId;

    fn pool_name(&self) -> String;

    /// Current object namespace
    fn namespace(&self) -> String;

    /// Switch object namespace. Only call this on a context the caller owns
    /// exclusively; cached contexts are shared.
    fn set_namespace(&self, namespace: &str);

    /// Whether an image namespace exists in this pool
    fn namespace_exists(&self, namespace: &str) -> Result<bool>;

    /// Allow writes while the cluster is flagged full
    fn set_osdmap_full_try(&self);

    fn pool_stat(&self) -> Result<PoolStat>;

    /// Execute a write batch atomically against one object
    fn operate_write(&self, oid: &str, op: &WriteOp) -> Result<()>;

    /// Execute a read batch against one object
    fn operate_read(&self, oid: &str, op: &ReadOp) -> Result<ReadOpOutput>;

    /// Open a block image by name
    fn open_image(&self, name: &str) -> Result<Box<dyn Image>>;

    /// Open a block image by id
    fn open_image_by_id(&self, id: &str) -> Result<Box<dyn Image>>;

    /// Release the handle. Further operations fail.
    fn close(&self);
}

/// Snapshot namespace an image snapshot lives in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapNamespaceType {
    User,
    Group,
    Trash,
    Mirror,
}

/// One image snapshot as listed by the cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageSnap {
    pub id: SnapId,
    pub name: String,
    pub size: u64,
}

/// An opened block image
pub trait Image: Send {
    fn name(&self) -> String;

    fn id(&self) -> String;

    fn snap_list(&self) -> Result<Vec<ImageSnap>>;

    fn snap_namespace_type(&self, snap: SnapId) -> Result<SnapNamespaceType>;

    fn snap_create(&self, name: &str) -> Result<()>;

    fn snap_remove(&self, name: &str, force: bool) -> Result<()>;

    fn snap_remove_by_id(&self, snap: SnapId) -> Result<()>;
}
