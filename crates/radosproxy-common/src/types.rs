//! Core types for RadosProxy

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric pool identifier as assigned by the cluster
pub type PoolId = i64;

/// Snapshot identifier
pub type SnapId = u64;

/// Pool lookup key: a pool is addressed either by name or by numeric id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PoolKey {
    Name(String),
    Id(PoolId),
}

impl PoolKey {
    /// Reject the two "unset" forms: an empty name and pool id zero.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Name(name) if name.is_empty() => {
                Err(Error::invalid_argument("pool name is empty"))
            }
            Self::Id(id) if *id <= 0 => Err(Error::invalid_argument(format!(
                "pool id {id} is not a valid lookup key"
            ))),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "{name}"),
            Self::Id(id) => write!(f, "#{id}"),
        }
    }
}

impl From<&str> for PoolKey {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<PoolId> for PoolKey {
    fn from(id: PoolId) -> Self {
        Self::Id(id)
    }
}

/// Usage figures for one pool, as recorded by the usage monitor
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolUsageInfo {
    /// Logical bytes stored
    pub stored_size: u64,
    /// Number of objects
    pub objects: u64,
    /// Raw bytes used, including redundancy
    pub used_size: u64,
    /// Used fraction, 0.0 to 1.0
    pub use_ratio: f64,
    /// Available bytes adjusted by the pool's redundancy multiplier
    pub max_avail: u64,
    /// Monitor cycle that last wrote this entry
    pub version: u64,
}

/// Kind of pool lifecycle event delivered to observers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolEvent {
    Created,
    Deleted,
}

impl fmt::Display for PoolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "create"),
            Self::Deleted => write!(f, "delete"),
        }
    }
}

/// Cluster-wide capacity figures, in KiB
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStat {
    pub kb: u64,
    pub kb_used: u64,
    pub kb_avail: u64,
    pub num_objects: u64,
}

/// Per-pool statistics reported by the cluster
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStat {
    pub num_bytes: u64,
    pub num_kb: u64,
    pub num_objects: u64,
    pub num_object_clones: u64,
    pub num_object_copies: u64,
    pub num_objects_missing_on_primary: u64,
    pub num_objects_unfound: u64,
    pub num_objects_degraded: u64,
    pub num_rd: u64,
    pub num_rd_kb: u64,
    pub num_wr: u64,
    pub num_wr_kb: u64,
}

impl PoolStat {
    /// Redundancy multiplier: object copies per object, 3 when either count is zero.
    #[must_use]
    pub fn replication_multiplier(&self) -> f64 {
        if self.num_objects == 0 || self.num_object_copies == 0 {
            DEFAULT_REPLICATION
        } else {
            self.num_object_copies as f64 / self.num_objects as f64
        }
    }
}

/// Replication factor assumed for empty pools
pub const DEFAULT_REPLICATION: f64 = 3.0;

/// Backing device class for allocation size queries
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BdevType {
    Hdd,
    Ssd,
}

impl BdevType {
    /// Name of the cluster config option holding the minimum allocation size
    #[must_use]
    pub const fn min_alloc_option(self) -> &'static str {
        match self {
            Self::Hdd => "bluestore_min_alloc_size_hdd",
            Self::Ssd => "bluestore_min_alloc_size_ssd",
        }
    }
}

/// One image snapshot
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapInfo {
    pub id: SnapId,
    pub name: String,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_key_validation() {
        assert!(PoolKey::Name("rbd".into()).validate().is_ok());
        assert!(PoolKey::Id(3).validate().is_ok());
        assert!(PoolKey::Name(String::new()).validate().is_err());
        assert!(PoolKey::Id(0).validate().is_err());
        assert!(PoolKey::Id(-1).validate().is_err());
    }

    #[test]
    fn test_replication_multiplier() {
        let empty = PoolStat::default();
        assert!((empty.replication_multiplier() - 3.0).abs() < f64::EPSILON);

        let stat = PoolStat {
            num_objects: 100,
            num_object_copies: 200,
            ..PoolStat::default()
        };
        assert!((stat.replication_multiplier() - 2.0).abs() < f64::EPSILON);

        let copies_only = PoolStat {
            num_object_copies: 10,
            ..PoolStat::default()
        };
        assert!((copies_only.replication_multiplier() - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_min_alloc_option() {
        assert_eq!(BdevType::Hdd.min_alloc_option(), "bluestore_min_alloc_size_hdd");
        assert_eq!(BdevType::Ssd.min_alloc_option(), "bluestore_min_alloc_size_ssd");
    }
}
