//! Block image snapshot helpers
//!
//! Every call takes its own reference on the shared cluster connection,
//! opens a private pool context (and image, where needed), does its work
//! and releases everything again. When the proxy already holds the
//! connection this costs no reconnect; otherwise the connection lives only
//! for the duration of the call.

use radosproxy_cluster::{ClientHandle, ClientRef, ClusterClient, Image, IoCtx, SnapNamespaceType};
use radosproxy_common::config::ClusterSection;
use radosproxy_common::{Error, PoolId, Result, SnapId, SnapInfo};
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, warn};

const RBD_CACHE_OPTION: &str = "rbd_cache_writethrough_until_flush";

/// Identifies one image: a pool by name or id, an optional namespace and
/// the image by id or name. Names win over ids when both are set for the
/// pool; ids win for the image.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageSpec {
    pub pool_name: String,
    pub pool_id: PoolId,
    pub namespace: String,
    pub image_name: String,
    pub image_id: String,
}

impl ImageSpec {
    pub fn in_pool_named(pool: impl Into<String>) -> Self {
        Self {
            pool_name: pool.into(),
            ..Self::default()
        }
    }

    pub fn in_pool(pool: PoolId) -> Self {
        Self {
            pool_id: pool,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    #[must_use]
    pub fn image_named(mut self, name: impl Into<String>) -> Self {
        self.image_name = name.into();
        self
    }

    #[must_use]
    pub fn image_id(mut self, id: impl Into<String>) -> Self {
        self.image_id = id.into();
        self
    }

    fn validate(&self) -> Result<()> {
        if self.pool_id == 0 && self.pool_name.is_empty() {
            return Err(Error::invalid_argument("both pool id and pool name are empty"));
        }
        if self.image_id.is_empty() && self.image_name.is_empty() {
            return Err(Error::invalid_argument("both image id and image name are empty"));
        }
        Ok(())
    }
}

/// Snapshot to remove
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SnapTarget {
    Id(SnapId),
    Name(String),
}

impl SnapTarget {
    fn validate(&self) -> Result<()> {
        match self {
            Self::Id(0) => Err(Error::invalid_argument("snapshot id is 0")),
            Self::Name(name) if name.is_empty() => {
                Err(Error::invalid_argument("snapshot name is empty"))
            }
            _ => Ok(()),
        }
    }
}

/// Closes the context when dropped
struct ScopedIoCtx(Arc<dyn IoCtx>);

impl Deref for ScopedIoCtx {
    type Target = dyn IoCtx;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Drop for ScopedIoCtx {
    fn drop(&mut self) {
        self.0.close();
    }
}

fn is_enoent(e: &Error) -> bool {
    e.errno() == -libc::ENOENT
}

/// Snapshot and lookup helpers over the shared connection
pub struct SnapshotService {
    handle: Arc<ClientHandle>,
    conf_path: PathBuf,
    options: Vec<(String, String)>,
}

impl SnapshotService {
    pub fn new(handle: Arc<ClientHandle>, cluster: &ClusterSection) -> Self {
        Self {
            handle,
            conf_path: cluster.ceph_conf.clone(),
            options: cluster.client_options(),
        }
    }

    fn session(&self, rbd: bool) -> Result<ClientRef> {
        let mut options = self.options.clone();
        if rbd {
            options.push((RBD_CACHE_OPTION.to_string(), "false".to_string()));
        }
        self.handle
            .acquire(&self.conf_path, &options)
            .inspect_err(|e| error!("Cluster client init failed: {}", e))
    }

    /// Create snapshot `name` and return its id. An existing snapshot of
    /// that name counts as created.
    pub fn snap_create(&self, spec: &ImageSpec, name: &str) -> Result<SnapId> {
        spec.validate()?;
        if name.is_empty() {
            return Err(Error::invalid_argument("snapshot name is empty"));
        }

        let session = self.session(true)?;
        let ctx = open_ioctx(session.client().as_ref(), spec)?;
        let image = open_image(&ctx, spec)?;

        match image.snap_create(name) {
            Ok(()) => {}
            Err(e) if e.errno() == -libc::EEXIST => {
                debug!("Snapshot {} of {} already exists", name, image.id());
            }
            Err(e) => {
                error!("Create snapshot {} of {} failed: {}", name, image.id(), e);
                return Err(e);
            }
        }

        let snaps = user_snaps(image.as_ref()).map_err(|e| {
            error!("List snapshots of {} failed: {}, retry later", image.id(), e);
            Error::cluster("snap list", -libc::EAGAIN)
        })?;
        let id = snaps
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.id)
            .ok_or_else(|| Error::cluster(format!("snap lookup {name}"), -libc::EAGAIN))?;
        debug!(
            "Created snapshot {}:{} of image {} in pool {}",
            id,
            name,
            image.id(),
            ctx.pool_id()
        );
        Ok(id)
    }

    /// Remove a snapshot. A missing pool, namespace, image or snapshot
    /// counts as removed.
    pub fn snap_remove(&self, spec: &ImageSpec, target: &SnapTarget, force: bool) -> Result<()> {
        spec.validate()?;
        target.validate()?;

        let session = self.session(true)?;
        let ctx = match open_ioctx(session.client().as_ref(), spec) {
            Ok(ctx) => ctx,
            Err(e) if is_enoent(&e) => return Ok(()),
            Err(e) => return Err(e),
        };
        ctx.set_osdmap_full_try();

        let image = match open_image(&ctx, spec) {
            Ok(image) => image,
            Err(e) if is_enoent(&e) => return Ok(()),
            Err(e) => return Err(e),
        };

        let removed = match target {
            SnapTarget::Name(name) => image.snap_remove(name, force),
            SnapTarget::Id(id) => image.snap_remove_by_id(*id),
        };
        match removed {
            Ok(()) => {
                debug!("Removed snapshot {:?} of image {}", target, image.id());
                Ok(())
            }
            Err(e) if is_enoent(&e) => Ok(()),
            Err(e) => {
                error!("Remove snapshot {:?} of {} failed: {}", target, image.id(), e);
                Err(e)
            }
        }
    }

    /// User snapshots of an image, ordered by id
    pub fn snap_list(&self, spec: &ImageSpec) -> Result<Vec<SnapInfo>> {
        spec.validate()?;
        let session = self.session(true)?;
        let ctx = open_ioctx(session.client().as_ref(), spec)?;
        let image = open_image(&ctx, spec)?;
        user_snaps(image.as_ref())
    }

    pub fn pool_id(&self, pool_name: &str, namespace: &str) -> Result<PoolId> {
        let spec = ImageSpec::in_pool_named(pool_name).namespace(namespace);
        if spec.pool_name.is_empty() {
            return Err(Error::invalid_argument("pool name is empty"));
        }
        let session = self.session(false)?;
        let ctx = open_ioctx(session.client().as_ref(), &spec)?;
        Ok(ctx.pool_id())
    }

    pub fn pool_name(&self, pool_id: PoolId, namespace: &str) -> Result<String> {
        if pool_id == 0 {
            return Err(Error::invalid_argument("pool id is 0"));
        }
        let spec = ImageSpec::in_pool(pool_id).namespace(namespace);
        let session = self.session(false)?;
        let ctx = open_ioctx(session.client().as_ref(), &spec)?;
        Ok(ctx.pool_name())
    }

    /// Id of the image named in `spec`
    pub fn image_id(&self, spec: &ImageSpec) -> Result<String> {
        if spec.image_name.is_empty() {
            return Err(Error::invalid_argument("image name is empty"));
        }
        let spec = ImageSpec {
            image_id: String::new(),
            ..spec.clone()
        };
        spec.validate()?;
        let session = self.session(false)?;
        let ctx = open_ioctx(session.client().as_ref(), &spec)?;
        Ok(open_image(&ctx, &spec)?.id())
    }

    /// Name of the image whose id is in `spec`
    pub fn image_name(&self, spec: &ImageSpec) -> Result<String> {
        if spec.image_id.is_empty() {
            return Err(Error::invalid_argument("image id is empty"));
        }
        spec.validate()?;
        let session = self.session(false)?;
        let ctx = open_ioctx(session.client().as_ref(), spec)?;
        Ok(open_image(&ctx, spec)?.name())
    }
}

fn open_ioctx(client: &dyn ClusterClient, spec: &ImageSpec) -> Result<ScopedIoCtx> {
    let ctx = if spec.pool_name.is_empty() {
        client.ioctx_create_by_id(spec.pool_id)
    } else {
        client.ioctx_create(&spec.pool_name)
    };
    let ctx = ScopedIoCtx(ctx.inspect_err(|e| {
        error!("Open pool {}/{} failed: {}", spec.pool_name, spec.pool_id, e);
    })?);

    if !spec.namespace.is_empty() && !ctx.namespace_exists(&spec.namespace)? {
        error!("Namespace {} does not exist", spec.namespace);
        return Err(Error::NotFound(format!("namespace {}", spec.namespace)));
    }
    ctx.set_namespace(&spec.namespace);
    Ok(ctx)
}

fn open_image(ctx: &ScopedIoCtx, spec: &ImageSpec) -> Result<Box<dyn Image>> {
    let image = if spec.image_id.is_empty() {
        ctx.open_image(&spec.image_name)
    } else {
        ctx.open_image_by_id(&spec.image_id)
    };
    image.inspect_err(|e| {
        error!(
            "Open image {}/{} failed: {}",
            spec.image_name, spec.image_id, e
        );
    })
}

/// Snapshots in the user namespace, by ascending id. A snapshot whose
/// namespace cannot be read is kept.
fn user_snaps(image: &dyn Image) -> Result<Vec<SnapInfo>> {
    let mut snaps: Vec<SnapInfo> = image
        .snap_list()?
        .into_iter()
        .filter(|s| match image.snap_namespace_type(s.id) {
            Ok(kind) => kind == SnapNamespaceType::User,
            Err(e) => {
                warn!("Namespace of snapshot {}:{} unknown: {}", s.id, s.name, e);
                true
            }
        })
        .map(|s| SnapInfo {
            id: s.id,
            name: s.name,
            size: s.size,
        })
        .collect();
    snaps.sort_by_key(|s| s.id);
    Ok(snaps)
}
