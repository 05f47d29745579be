//! Op batches queued through the proxy worker pool

use radosproxy_cluster::{ClusterClient, Completion, IoCtxTable, OpBatch, ReadOp, ReadOpOutput, WriteOp};
use radosproxy_common::{PoolId, PoolKey, Result};
use radosproxy_dispatch::{OpProcessor, ShardKey};
use std::sync::Arc;
use tracing::debug;

/// One batch against one object, with the completion to fire when done
#[derive(Debug)]
pub struct ProxyOp {
    pub pool_id: PoolId,
    pub object: String,
    pub batch: OpBatch,
    completion: Completion,
    output: ReadOpOutput,
}

impl ProxyOp {
    pub fn new(pool_id: PoolId, object: impl Into<String>, batch: OpBatch, completion: Completion) -> Self {
        Self {
            pool_id,
            object: object.into(),
            batch,
            completion,
            output: ReadOpOutput::default(),
        }
    }

    pub fn write(pool_id: PoolId, object: impl Into<String>, op: WriteOp, completion: Completion) -> Self {
        Self::new(pool_id, object, OpBatch::Write(op), completion)
    }

    pub fn read(pool_id: PoolId, object: impl Into<String>, op: ReadOp, completion: Completion) -> Self {
        Self::new(pool_id, object, OpBatch::Read(op), completion)
    }

    /// Fire the completion without running the batch
    pub fn fail(self, rc: i32) {
        self.completion.complete(rc, ReadOpOutput::default());
    }
}

impl ShardKey for ProxyOp {
    fn shard_key(&self) -> &[u8] {
        self.object.as_bytes()
    }
}

/// Runs each batch against the cached context of its pool
pub struct ProxyOpProcessor {
    client: Arc<dyn ClusterClient>,
    ioctxs: Arc<IoCtxTable>,
}

impl ProxyOpProcessor {
    pub const fn new(client: Arc<dyn ClusterClient>, ioctxs: Arc<IoCtxTable>) -> Self {
        Self { client, ioctxs }
    }
}

impl OpProcessor<ProxyOp> for ProxyOpProcessor {
    fn process(&self, worker: usize, item: &mut ProxyOp) -> Result<()> {
        let ctx = self
            .ioctxs
            .get_or_open(self.client.as_ref(), &PoolKey::Id(item.pool_id))?;
        match &item.batch {
            OpBatch::Write(op) => ctx.operate_write(&item.object, op)?,
            OpBatch::Read(op) => item.output = ctx.operate_read(&item.object, op)?,
        }
        debug!(
            "Worker {} ran {} ops on {}/{}",
            worker,
            match &item.batch {
                OpBatch::Write(op) => op.len(),
                OpBatch::Read(op) => op.len(),
            },
            item.pool_id,
            item.object
        );
        Ok(())
    }

    fn complete(&self, item: ProxyOp, result: Result<()>) {
        let rc = match &result {
            Ok(()) => 0,
            Err(e) => {
                debug!("Op on {}/{} failed: {}", item.pool_id, item.object, e);
                e.errno()
            }
        };
        item.completion.complete(rc, item.output);
    }
}
