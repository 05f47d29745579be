//! Per-item work of the adaptor's worker pool

use crate::handler::{Connection, OpHandler};
use crate::request::OpRequest;
use crate::wire::{ClientRequest, OpOutput, OpReply};
use radosproxy_common::{Error, Result};
use radosproxy_dispatch::{OpProcessor, ShardKey};
use std::sync::Arc;
use tracing::{debug, warn};

/// A request waiting in an adaptor queue, with the connection to answer on
pub struct InboundOp {
    pub request: ClientRequest,
    pub conn: Arc<dyn Connection>,
    outputs: Vec<OpOutput>,
    status: Option<i32>,
}

impl InboundOp {
    pub fn new(request: ClientRequest, conn: Arc<dyn Connection>) -> Self {
        Self {
            request,
            conn,
            outputs: Vec::new(),
            status: None,
        }
    }

    /// Answer without processing
    pub fn reply_status(self, result: i32) {
        let tid = self.request.tid;
        if let Err(e) = self.conn.send_reply(OpReply::status(tid, result)) {
            warn!("Reply {} to {} failed: {}", tid, self.conn.peer(), e);
        }
    }
}

impl ShardKey for InboundOp {
    fn shard_key(&self) -> &[u8] {
        self.request.object.as_bytes()
    }
}

/// Normalises each request, runs it through the handler and replies
pub struct AdaptorProcessor {
    handler: Arc<dyn OpHandler>,
}

impl AdaptorProcessor {
    pub fn new(handler: Arc<dyn OpHandler>) -> Self {
        Self { handler }
    }
}

impl OpProcessor<InboundOp> for AdaptorProcessor {
    fn process(&self, worker: usize, item: &mut InboundOp) -> Result<()> {
        let request = OpRequest::from_wire(&mut item.request).inspect_err(|e| {
            warn!("Reject request {} on {}: {}", item.request.tid, item.request.object, e);
        })?;

        let mut outputs = vec![OpOutput::default(); request.ops.len()];
        let rc = self.handler.handle(worker, &request, &mut outputs);
        debug!(
            "Handled {} ({:?}, {} ops) on worker {}: {}",
            request.object,
            request.access,
            request.ops.len(),
            worker,
            rc
        );
        item.outputs = outputs;
        item.status = Some(rc);
        if rc < 0 {
            Err(Error::from_errno(rc, format!("object {}", request.object)))
        } else {
            Ok(())
        }
    }

    fn complete(&self, item: InboundOp, result: Result<()>) {
        let result = match (item.status, &result) {
            (Some(rc), _) => rc,
            (None, Err(e)) => e.errno(),
            (None, Ok(())) => 0,
        };
        let reply = OpReply {
            tid: item.request.tid,
            result,
            ops: item.outputs,
        };
        if let Err(e) = item.conn.send_reply(reply) {
            warn!("Reply {} to {} failed: {}", item.request.tid, item.conn.peer(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{NOSNAP, SubOp};
    use crate::wire::{ClientOp, ReplyData};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingConn {
        replies: Mutex<Vec<OpReply>>,
    }

    impl Connection for RecordingConn {
        fn send_reply(&self, reply: OpReply) -> Result<()> {
            self.replies.lock().push(reply);
            Ok(())
        }

        fn peer(&self) -> String {
            "test".to_string()
        }
    }

    struct EchoHandler;

    impl OpHandler for EchoHandler {
        fn handle(&self, _worker: usize, request: &OpRequest, outputs: &mut [OpOutput]) -> i32 {
            if request.object == "fail" {
                return -libc::EIO;
            }
            for (op, out) in request.ops.iter().zip(outputs.iter_mut()) {
                if let SubOp::Read { len, .. } = op {
                    out.data = ReplyData::Bytes(vec![7; usize::try_from(*len).unwrap()]);
                }
            }
            0
        }
    }

    fn inbound(object: &str, ops: Vec<ClientOp>, conn: &Arc<RecordingConn>) -> InboundOp {
        let conn: Arc<dyn Connection> = conn.clone();
        InboundOp::new(
            ClientRequest {
                tid: 5,
                pool_id: 1,
                pg_seed: 0,
                snap_id: NOSNAP,
                object: object.to_string(),
                ops,
            },
            conn,
        )
    }

    fn run(object: &str, ops: Vec<ClientOp>) -> OpReply {
        let conn = Arc::new(RecordingConn::default());
        let processor = AdaptorProcessor::new(Arc::new(EchoHandler));
        let mut item = inbound(object, ops, &conn);
        let result = processor.process(0, &mut item);
        processor.complete(item, result);
        let mut replies = conn.replies.lock();
        assert_eq!(replies.len(), 1);
        replies.remove(0)
    }

    #[test]
    fn test_reply_carries_outputs() {
        let reply = run("obj", vec![ClientOp::read(0, 3), ClientOp::stat()]);
        assert_eq!(reply.tid, 5);
        assert_eq!(reply.result, 0);
        assert_eq!(reply.ops.len(), 2);
        assert_eq!(reply.ops[0].data, ReplyData::Bytes(vec![7, 7, 7]));
    }

    #[test]
    fn test_handler_status_propagates() {
        let reply = run("fail", vec![ClientOp::stat()]);
        assert_eq!(reply.result, -libc::EIO);
        assert_eq!(reply.ops.len(), 1);
    }

    #[test]
    fn test_bad_rbd_name_never_reaches_handler() {
        let reply = run("rbd_data.1", vec![ClientOp::stat()]);
        assert_eq!(reply.result, -libc::EINVAL);
        assert!(reply.ops.is_empty());
    }

    #[test]
    fn test_shard_key_is_object_name() {
        let conn = Arc::new(RecordingConn::default());
        let item = inbound("abc", Vec::new(), &conn);
        assert_eq!(item.shard_key(), b"abc");
        item.reply_status(-libc::ESHUTDOWN);
        assert_eq!(conn.replies.lock()[0].result, -libc::ESHUTDOWN);
    }
}
