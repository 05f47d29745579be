//! Cluster backend selection
//!
//! The `[backend]` table sits next to the proxy sections in the server's
//! TOML file. The in-process `memory` backend can be seeded with pools,
//! namespaces and images so a fresh server has something to serve.

use radosproxy_cluster::{ClusterClient, MemCluster};
use radosproxy_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

const GIB: u64 = 1024 * 1024 * 1024;

/// The part of the server file this module reads
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BackendFile {
    #[serde(default)]
    pub backend: BackendSection,
}

impl BackendFile {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::configuration(e.to_string()))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendSection {
    /// Backend kind; only `memory` is built in
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Raw capacity of the memory backend
    #[serde(default = "default_capacity_gib")]
    pub capacity_gib: u64,
    #[serde(default)]
    pub pools: Vec<PoolSeed>,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            capacity_gib: default_capacity_gib(),
            pools: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolSeed {
    pub name: String,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub images: Vec<ImageSeed>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageSeed {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    /// Image size in bytes
    pub size: u64,
}

fn default_kind() -> String {
    "memory".to_string()
}

const fn default_capacity_gib() -> u64 {
    100
}

const fn default_replicas() -> u32 {
    3
}

/// Build the cluster client described by `section`
pub fn build(section: &BackendSection) -> Result<Arc<dyn ClusterClient>> {
    match section.kind.as_str() {
        "memory" => {
            let cluster = MemCluster::with_capacity(section.capacity_gib.saturating_mul(GIB));
            seed(&cluster, &section.pools)?;
            Ok(Arc::new(cluster))
        }
        other => Err(Error::configuration(format!("unknown backend kind {other:?}"))),
    }
}

/// Create the seeded pools, namespaces and images
pub fn seed(cluster: &MemCluster, pools: &[PoolSeed]) -> Result<()> {
    for pool in pools {
        let id = cluster.create_pool(&pool.name, pool.replicas)?;
        for ns in &pool.namespaces {
            cluster.create_namespace(id, ns)?;
        }
        for image in &pool.images {
            if !image.namespace.is_empty() {
                cluster.create_namespace(id, &image.namespace)?;
            }
            let image_id = cluster.create_image(id, &image.namespace, &image.name, image.size)?;
            info!("Seeded image {}/{} as {}", pool.name, image.name, image_id);
        }
        info!("Seeded pool {} with id {}", pool.name, id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_backend_table() {
        let file = BackendFile::from_toml("[worker]\nworker_num = 2\n").unwrap();
        assert_eq!(file.backend.kind, "memory");
        assert_eq!(file.backend.capacity_gib, 100);
        assert!(file.backend.pools.is_empty());
    }

    #[test]
    fn test_seeded_pools_and_images() {
        let file = BackendFile::from_toml(
            r#"
            [backend]
            capacity_gib = 1

            [[backend.pools]]
            name = "rbd"
            namespaces = ["tenant"]

            [[backend.pools.images]]
            name = "disk0"
            size = 1048576

            [[backend.pools.images]]
            name = "disk1"
            namespace = "other"
            size = 4096

            [[backend.pools]]
            name = "meta"
            replicas = 2
            "#,
        )
        .unwrap();
        assert_eq!(file.backend.pools[0].replicas, 3);
        assert_eq!(file.backend.pools[1].replicas, 2);

        let cluster = MemCluster::with_capacity(GIB);
        seed(&cluster, &file.backend.pools).unwrap();
        assert_eq!(cluster.pool_id("rbd"), Some(1));
        assert_eq!(cluster.pool_id("meta"), Some(2));
    }

    #[test]
    fn test_duplicate_pool_fails() {
        let cluster = MemCluster::new();
        let pool = PoolSeed {
            name: "rbd".into(),
            replicas: 3,
            namespaces: Vec::new(),
            images: Vec::new(),
        };
        assert!(seed(&cluster, &[pool.clone(), pool]).is_err());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let section = BackendSection {
            kind: "rados".into(),
            ..BackendSection::default()
        };
        let err = build(&section).err().unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
