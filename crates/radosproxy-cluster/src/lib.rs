//! RadosProxy cluster layer
//!
//! The [`ClusterClient`]/[`IoCtx`]/[`Image`] traits are the seam to the
//! storage cluster. On top of them sit the reference-counted connection
//! ([`ClientHandle`]), the pool context cache ([`IoCtxTable`]) and the typed
//! operation batches the proxy queues.

pub mod client;
pub mod completion;
pub mod handle;
pub mod ioctx;
pub mod memory;
pub mod op;

pub use client::{ClusterClient, Image, ImageSnap, IoCtx, MonCommandOutput, SnapNamespaceType};
pub use completion::{Completion, CompletionWaiter};
pub use handle::{ClientHandle, ClientRef, ConnectionState, RetryPolicy};
pub use ioctx::IoCtxTable;
pub use memory::{MAX_OBJECT_SIZE, MemCluster};
pub use op::{
    ChecksumType, CmpOp, Guard, OpBatch, ReadData, ReadOp, ReadOpOutput, ReadSubOp, SubOpResult,
    WriteOp, WriteSubOp,
};
