//! RadosProxy server adaptor
//!
//! Receives client storage requests over the messenger, routes them to
//! per-object worker queues, normalises each request and hands it to the
//! downstream [`OpHandler`]. Replies travel back through the
//! [`Connection`] the request arrived on.

pub mod adaptor;
pub mod handler;
pub mod messenger;
pub mod processor;
pub mod request;
pub mod wire;

pub use adaptor::{AdaptorConfig, ServerAdaptor};
pub use handler::{Connection, OpHandler};
pub use messenger::Messenger;
pub use processor::{AdaptorProcessor, InboundOp};
pub use request::{Access, NOSNAP, OpRequest, RbdObjectId, SubOp};
pub use wire::{ClientOp, ClientRequest, OpCode, OpOutput, OpReply, ReplyData};
