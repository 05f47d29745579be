//! RadosProxy pool usage monitoring
//!
//! - [`df`]: parser for the cluster's tabular `df` report
//! - [`notify`]: one-shot pool create/delete observers
//! - [`usage`]: the periodic scrape, reconcile and notify loop

pub mod df;
pub mod notify;
pub mod usage;

pub use df::{DfRecord, parse_line, parse_report};
pub use notify::{PoolEventNotifier, PoolEventObserver};
pub use usage::{ClusterUsageSource, CycleReport, PoolUsageMonitor, UsageSource};
