//! RadosProxy core
//!
//! [`Proxy`] ties the cluster connection, the pool context cache, the proxy
//! worker pool and the pool usage monitor together behind one handle.
//! [`SnapshotService`] offers the block-image snapshot helpers, each call
//! sharing the same reference-counted connection.

pub mod ops;
pub mod proxy;
pub mod snap;

pub use ops::{ProxyOp, ProxyOpProcessor};
pub use proxy::{Proxy, ProxyState};
pub use snap::{ImageSpec, SnapTarget, SnapshotService};
