//! Executes normalised adaptor requests through the proxy
//!
//! Each request becomes one write or read batch, is queued on the proxy's
//! worker for its object and the adaptor worker waits for the completion.

use radosproxy_adaptor::{Access, NOSNAP, OpHandler, OpOutput, OpRequest, ReplyData, SubOp};
use radosproxy_cluster::{Completion, ReadData, ReadOp, ReadOpOutput, SubOpResult, WriteOp};
use radosproxy_common::{Error, Result};
use radosproxy_core::{Proxy, ProxyOp};
use std::sync::Arc;
use tracing::{debug, warn};

/// [`OpHandler`] backed by a [`Proxy`]
pub struct ProxyOpHandler {
    proxy: Arc<Proxy>,
}

impl ProxyOpHandler {
    pub const fn new(proxy: Arc<Proxy>) -> Self {
        Self { proxy }
    }
}

impl OpHandler for ProxyOpHandler {
    fn handle(&self, worker: usize, request: &OpRequest, outputs: &mut [OpOutput]) -> i32 {
        let op = match build_op(request) {
            Ok(op) => op,
            Err(e) => {
                warn!("Cannot run request {} on {}: {}", request.sequence, request.object, e);
                return e.errno();
            }
        };

        let (completion, waiter) = Completion::channel();
        let op = match op {
            Batch::Write(w) => ProxyOp::write(request.pool_id, request.object.clone(), w, completion),
            Batch::Read(r) => ProxyOp::read(request.pool_id, request.object.clone(), r, completion),
        };
        if let Err(e) = self.proxy.queue_op(op) {
            debug!("Queue request {} failed: {}", request.sequence, e);
        }
        let (rc, output) = waiter.wait();
        debug!(
            "Request {} on {}/{} from worker {}: {}",
            request.sequence, request.pool_id, request.object, worker, rc
        );
        if rc == 0 && request.access == Access::Read {
            fill_outputs(&request.ops, output, outputs);
        }
        rc
    }
}

enum Batch {
    Write(WriteOp),
    Read(ReadOp),
}

/// Translate sub-ops into one batch. Guards go into either kind; data
/// reads inside a write request are not supported.
fn build_op(request: &OpRequest) -> Result<Batch> {
    match request.access {
        Access::Write => {
            let mut op = WriteOp::new();
            for sub in &request.ops {
                add_write(&mut op, sub)?;
            }
            Ok(Batch::Write(op))
        }
        Access::Read => {
            if request.snap_id != NOSNAP {
                return Err(Error::NotSupported(format!(
                    "read at snapshot {}",
                    request.snap_id
                )));
            }
            let mut op = ReadOp::new();
            for sub in &request.ops {
                add_read(&mut op, sub)?;
            }
            Ok(Batch::Read(op))
        }
    }
}

fn add_write(op: &mut WriteOp, sub: &SubOp) -> Result<()> {
    match sub {
        SubOp::AssertExists => op.assert_exists(),
        SubOp::AssertVersion(v) => op.assert_version(*v),
        SubOp::CmpExt { offset, data } => op.cmpext(*offset, data.clone()),
        SubOp::CmpXattr { name, op: cmp, value } => op.cmpxattr(name, *cmp, value.clone()),
        SubOp::OmapCmp { key, op: cmp, value } => op.omap_cmp(key, *cmp, value.clone()),
        SubOp::Create { exclusive } => op.create(*exclusive),
        SubOp::Write { offset, data } => op.write(*offset, data.clone()),
        SubOp::WriteFull { data } => op.write_full(data.clone()),
        SubOp::WriteSame {
            offset,
            write_len,
            data,
        } => op.write_same(*offset, *write_len, data.clone()),
        SubOp::Append { data } => op.append(data.clone()),
        SubOp::Delete => op.remove(),
        SubOp::Truncate { size } => op.truncate(*size),
        SubOp::Zero { offset, len } => op.zero(*offset, *len),
        SubOp::SetXattr { name, value } => op.setxattr(name, value.clone()),
        SubOp::RmXattr { name } => op.rmxattr(name),
        SubOp::OmapSetVals { entries } => op.omap_set(entries.iter().cloned()),
        SubOp::OmapRmKeys { keys } => op.omap_rm_keys(keys.iter().cloned()),
        SubOp::OmapClear => op.omap_clear(),
        SubOp::SetAllocHint {
            object_size,
            write_size,
            flags,
        } => op.set_alloc_hint(*object_size, *write_size, *flags),
        other => {
            return Err(Error::NotSupported(format!(
                "{:?} inside a write request",
                other.code()
            )));
        }
    };
    Ok(())
}

fn add_read(op: &mut ReadOp, sub: &SubOp) -> Result<()> {
    match sub {
        SubOp::AssertExists => op.assert_exists(),
        SubOp::AssertVersion(v) => op.assert_version(*v),
        SubOp::CmpExt { offset, data } => op.cmpext(*offset, data.clone()),
        SubOp::CmpXattr { name, op: cmp, value } => op.cmpxattr(name, *cmp, value.clone()),
        SubOp::OmapCmp { key, op: cmp, value } => op.omap_cmp(key, *cmp, value.clone()),
        SubOp::Read { offset, len } | SubOp::SparseRead { offset, len } => op.read(*offset, *len),
        SubOp::Stat => op.stat(),
        SubOp::GetXattr { name } => op.getxattr(name),
        SubOp::GetXattrs => op.getxattrs(),
        SubOp::OmapGetKeys { start_after, max } => op.omap_get_keys(start_after, *max),
        SubOp::OmapGetVals {
            start_after,
            filter_prefix,
            max,
        } => op.omap_get_vals(start_after, filter_prefix, *max),
        SubOp::OmapGetValsByKeys { keys } => op.omap_get_vals_by_keys(keys.iter().cloned()),
        SubOp::Checksum {
            kind,
            init_value,
            offset,
            len,
            chunk_size,
        } => op.checksum(*kind, *init_value, *offset, *len, *chunk_size),
        other => {
            return Err(Error::invalid_argument(format!(
                "{:?} is not a read",
                other.code()
            )));
        }
    };
    Ok(())
}

fn fill_outputs(ops: &[SubOp], output: ReadOpOutput, outputs: &mut [OpOutput]) {
    for ((sub, result), out) in ops.iter().zip(output.results).zip(outputs.iter_mut()) {
        let SubOpResult { rval, data } = result;
        out.rval = rval;
        out.data = match (sub, data) {
            (SubOp::SparseRead { offset, .. }, ReadData::Bytes(b)) => {
                // Objects are dense: one extent covering what was read
                let extents = if b.is_empty() {
                    Vec::new()
                } else {
                    vec![(*offset, b.len() as u64)]
                };
                ReplyData::Extents {
                    extents,
                    data: b.to_vec(),
                }
            }
            (_, data) => reply_data(data),
        };
    }
}

fn reply_data(data: ReadData) -> ReplyData {
    match data {
        ReadData::None => ReplyData::None,
        ReadData::Bytes(b) => ReplyData::Bytes(b.to_vec()),
        ReadData::Stat { size, mtime } => ReplyData::Stat { size, mtime },
        ReadData::Xattrs(attrs) => {
            ReplyData::Xattrs(attrs.into_iter().map(|(k, v)| (k, v.to_vec())).collect())
        }
        ReadData::Keys { keys, more } => ReplyData::Keys { keys, more },
        ReadData::Vals { vals, more } => ReplyData::Vals {
            vals: vals.into_iter().map(|(k, v)| (k, v.to_vec())).collect(),
            more,
        },
        ReadData::Checksums(sums) => ReplyData::Checksums(sums),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use radosproxy_adaptor::{ClientOp, ClientRequest, OpCode};
    use radosproxy_cluster::MemCluster;
    use radosproxy_common::{PoolId, ProxyConfig};

    fn proxy() -> (Arc<Proxy>, PoolId) {
        let cluster = Arc::new(MemCluster::new());
        let pool = cluster.create_pool("rbd", 3).unwrap();
        let mut config = ProxyConfig::default();
        config.monitor.enabled = false;
        config.cluster.connect_retries = 1;
        (Proxy::init(&config, cluster).unwrap(), pool)
    }

    fn run(
        handler: &ProxyOpHandler,
        pool: PoolId,
        object: &str,
        ops: Vec<ClientOp>,
    ) -> (i32, Vec<OpOutput>) {
        run_at(handler, pool, object, NOSNAP, ops)
    }

    fn run_at(
        handler: &ProxyOpHandler,
        pool: PoolId,
        object: &str,
        snap_id: u64,
        ops: Vec<ClientOp>,
    ) -> (i32, Vec<OpOutput>) {
        let mut wire = ClientRequest {
            tid: 1,
            pool_id: pool,
            pg_seed: 0,
            snap_id,
            object: object.to_string(),
            ops,
        };
        let request = OpRequest::from_wire(&mut wire).unwrap();
        let mut outputs = vec![OpOutput::default(); request.ops.len()];
        let rc = handler.handle(0, &request, &mut outputs);
        (rc, outputs)
    }

    #[test]
    fn test_write_then_read_back() {
        let (proxy, pool) = proxy();
        let handler = ProxyOpHandler::new(proxy.clone());

        let (rc, _) = run(
            &handler,
            pool,
            "obj",
            vec![
                ClientOp::write(0, b"hello world".to_vec()),
                ClientOp::new(OpCode::SetXattr).name("k").data(b"v".to_vec()),
            ],
        );
        assert_eq!(rc, 0);

        let (rc, out) = run(
            &handler,
            pool,
            "obj",
            vec![
                ClientOp::read(6, 5),
                ClientOp::stat(),
                ClientOp::new(OpCode::GetXattrs),
            ],
        );
        assert_eq!(rc, 0);
        assert_eq!(out[0].data, ReplyData::Bytes(b"world".to_vec()));
        assert!(matches!(out[1].data, ReplyData::Stat { size: 11, .. }));
        assert_eq!(out[2].data, ReplyData::Xattrs(vec![("k".into(), b"v".to_vec())]));
        proxy.shutdown();
    }

    #[test]
    fn test_sparse_read_returns_extents() {
        let (proxy, pool) = proxy();
        let handler = ProxyOpHandler::new(proxy.clone());
        run(&handler, pool, "obj", vec![ClientOp::write(0, vec![1u8; 8])]);

        let (rc, out) = run(
            &handler,
            pool,
            "obj",
            vec![ClientOp::new(OpCode::SparseRead).extent(2, 4)],
        );
        assert_eq!(rc, 0);
        assert_eq!(
            out[0].data,
            ReplyData::Extents {
                extents: vec![(2, 4)],
                data: vec![1u8; 4],
            }
        );
    }

    #[test]
    fn test_out_of_range_extents_from_the_wire() {
        let (proxy, pool) = proxy();
        let handler = ProxyOpHandler::new(proxy.clone());
        run(&handler, pool, "obj", vec![ClientOp::write(0, b"0123456789".to_vec())]);

        let (rc, out) = run(
            &handler,
            pool,
            "obj",
            vec![
                ClientOp::read(1, u64::MAX),
                ClientOp::new(OpCode::SparseRead).extent(u64::MAX, 8),
            ],
        );
        assert_eq!(rc, 0);
        assert_eq!(out[0].data, ReplyData::Bytes(b"123456789".to_vec()));
        assert_eq!(
            out[1].data,
            ReplyData::Extents {
                extents: Vec::new(),
                data: Vec::new(),
            }
        );

        for op in [
            ClientOp::write(u64::MAX, vec![1u8; 4]),
            ClientOp::new(OpCode::Zero).extent(1, u64::MAX),
            ClientOp::new(OpCode::Truncate).extent(1 << 40, 0),
        ] {
            let (rc, _) = run(&handler, pool, "obj", vec![op]);
            assert_eq!(rc, -libc::EFBIG);
        }
        let (rc, out) = run(&handler, pool, "obj", vec![ClientOp::stat()]);
        assert_eq!(rc, 0);
        assert!(matches!(out[0].data, ReplyData::Stat { size: 10, .. }));
    }

    #[test]
    fn test_missing_object_read_is_enoent() {
        let (proxy, pool) = proxy();
        let handler = ProxyOpHandler::new(proxy.clone());
        let (rc, out) = run(&handler, pool, "none", vec![ClientOp::stat()]);
        assert_eq!(rc, -libc::ENOENT);
        assert_eq!(out[0].data, ReplyData::None);
    }

    #[test]
    fn test_snapshot_read_not_supported() {
        let (proxy, pool) = proxy();
        let handler = ProxyOpHandler::new(proxy.clone());
        let (rc, _) = run_at(&handler, pool, "obj", 4, vec![ClientOp::read(0, 1)]);
        assert_eq!(rc, -libc::EOPNOTSUPP);
    }

    #[test]
    fn test_read_inside_write_request_rejected() {
        let (proxy, pool) = proxy();
        let handler = ProxyOpHandler::new(proxy.clone());
        let (rc, _) = run(
            &handler,
            pool,
            "obj",
            vec![ClientOp::write(0, b"x".to_vec()), ClientOp::read(0, 1)],
        );
        assert_eq!(rc, -libc::EOPNOTSUPP);

        let (rc, _) = run(&handler, pool, "obj", vec![ClientOp::stat()]);
        assert_eq!(rc, -libc::ENOENT);
    }

    #[test]
    fn test_shut_down_proxy_answers_eshutdown() {
        let (proxy, pool) = proxy();
        let handler = ProxyOpHandler::new(proxy.clone());
        proxy.shutdown();
        let (rc, _) = run(&handler, pool, "obj", vec![ClientOp::stat()]);
        assert_eq!(rc, -libc::ESHUTDOWN);
    }
}
