//! Seams between the adaptor and its neighbours

use crate::request::OpRequest;
use crate::wire::{OpOutput, OpReply};
use radosproxy_common::Result;

/// The downstream module that executes normalised requests
pub trait OpHandler: Send + Sync + 'static {
    /// Execute `request` on worker `worker`. `outputs` holds one slot per
    /// sub-op; the handler fills in each rval and payload. Returns the
    /// request status, 0 or a negative errno.
    fn handle(&self, worker: usize, request: &OpRequest, outputs: &mut [OpOutput]) -> i32;
}

/// Reply path of the connection a request arrived on
pub trait Connection: Send + Sync {
    /// Queue `reply` for sending. Fails once the peer is gone.
    fn send_reply(&self, reply: OpReply) -> Result<()>;

    /// Peer description for logs
    fn peer(&self) -> String;
}
