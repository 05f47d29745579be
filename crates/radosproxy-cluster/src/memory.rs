//! In-process cluster
//!
//! [`MemCluster`] implements the cluster client traits over plain maps:
//! pools with a replica count, objects with data, xattrs and omap, image
//! namespaces, block images with snapshots, and a `df` report rendered in the
//! cluster's tabular text format. Failure injection and call counters make it
//! the fake collaborator for every cluster-facing test, and the standalone
//! server runs on it when no native backend is configured.

use crate::client::{
    ClusterClient, Image, ImageSnap, IoCtx, MonCommandOutput, SnapNamespaceType,
};
use crate::op::{
    Guard, MAX_ERRNO, ReadData, ReadOp, ReadOpOutput, ReadSubOp, SubOpResult, WriteOp,
    WriteSubOp, checksum_chunks,
};
use bytes::Bytes;
use parking_lot::Mutex;
use radosproxy_common::{ClusterStat, Error, PoolId, PoolStat, Result, SnapId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

const DEFAULT_CAPACITY: u64 = 1 << 40;
const DEFAULT_PGS: u32 = 32;

/// Largest object the cluster stores; writes past it fail with `-EFBIG`
pub const MAX_OBJECT_SIZE: u64 = 128 * 1024 * 1024;

#[derive(Clone, Debug, Default)]
struct MemObject {
    data: Vec<u8>,
    xattrs: BTreeMap<String, Bytes>,
    omap: BTreeMap<String, Bytes>,
    version: u64,
    mtime: u64,
}

#[derive(Clone, Debug)]
struct MemSnap {
    id: SnapId,
    name: String,
    size: u64,
    namespace_type: SnapNamespaceType,
}

#[derive(Clone, Debug)]
struct MemImage {
    id: String,
    name: String,
    namespace: String,
    size: u64,
    snaps: Vec<MemSnap>,
}

#[derive(Debug)]
struct MemPool {
    id: PoolId,
    name: String,
    replicas: u32,
    objects: BTreeMap<(String, String), MemObject>,
    namespaces: BTreeSet<String>,
    images: BTreeMap<String, MemImage>,
    next_snap_id: SnapId,
    next_image_seq: u64,
}

impl MemPool {
    fn stored_bytes(&self) -> u64 {
        self.objects.values().map(|o| o.data.len() as u64).sum()
    }

    fn used_bytes(&self) -> u64 {
        self.stored_bytes() * u64::from(self.replicas)
    }

    fn image_by_name(&self, namespace: &str, name: &str) -> Option<&MemImage> {
        self.images
            .values()
            .find(|i| i.namespace == namespace && i.name == name)
    }
}

#[derive(Debug)]
struct MemState {
    pools: BTreeMap<PoolId, MemPool>,
    next_pool_id: PoolId,
    conf: HashMap<String, String>,
    conf_file: Option<String>,
    connected: bool,
    capacity: u64,
    df_override: Option<String>,
}

impl MemState {
    fn pool_id_by_name(&self, name: &str) -> Option<PoolId> {
        self.pools.values().find(|p| p.name == name).map(|p| p.id)
    }

    fn pool(&self, id: PoolId) -> Result<&MemPool> {
        self.pools
            .get(&id)
            .ok_or_else(|| Error::PoolNotFound(format!("#{id}")))
    }

    fn pool_mut(&mut self, id: PoolId) -> Result<&mut MemPool> {
        self.pools
            .get_mut(&id)
            .ok_or_else(|| Error::PoolNotFound(format!("#{id}")))
    }

    fn raw_used(&self) -> u64 {
        self.pools.values().map(MemPool::used_bytes).sum()
    }
}

#[derive(Debug, Default)]
struct Faults {
    connect_failures: u32,
    mon_command_error: Option<i32>,
    pool_stat_errors: HashMap<PoolId, i32>,
}

#[derive(Debug, Default)]
struct Counters {
    connect: AtomicU64,
    shutdown: AtomicU64,
    ioctx_create: AtomicU64,
    ioctx_close: AtomicU64,
    mon_command: AtomicU64,
    pool_stat: AtomicU64,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<MemState>,
    faults: Mutex<Faults>,
    counters: Counters,
}

/// In-process cluster
#[derive(Clone, Debug)]
pub struct MemCluster {
    shared: Arc<Shared>,
}

impl Default for MemCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemCluster {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Cluster with `capacity` raw bytes
    #[must_use]
    pub fn with_capacity(capacity: u64) -> Self {
        let mut conf = HashMap::new();
        conf.insert("bluestore_min_alloc_size_hdd".to_string(), "65536".to_string());
        conf.insert("bluestore_min_alloc_size_ssd".to_string(), "4096".to_string());
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MemState {
                    pools: BTreeMap::new(),
                    next_pool_id: 1,
                    conf,
                    conf_file: None,
                    connected: false,
                    capacity,
                    df_override: None,
                }),
                faults: Mutex::new(Faults::default()),
                counters: Counters::default(),
            }),
        }
    }

    // Administration

    /// Create a pool with `replicas` copies per object
    pub fn create_pool(&self, name: &str, replicas: u32) -> Result<PoolId> {
        if name.is_empty() || replicas == 0 {
            return Err(Error::invalid_argument("pool needs a name and replicas"));
        }
        let mut state = self.shared.state.lock();
        if state.pool_id_by_name(name).is_some() {
            return Err(Error::AlreadyExists(format!("pool {name}")));
        }
        let id = state.next_pool_id;
        state.next_pool_id += 1;
        state.pools.insert(
            id,
            MemPool {
                id,
                name: name.to_string(),
                replicas,
                objects: BTreeMap::new(),
                namespaces: BTreeSet::new(),
                images: BTreeMap::new(),
                next_snap_id: 1,
                next_image_seq: 1,
            },
        );
        debug!("MemCluster created pool {} ({})", name, id);
        Ok(id)
    }

    pub fn delete_pool(&self, name: &str) -> Result<()> {
        let mut state = self.shared.state.lock();
        let id = state
            .pool_id_by_name(name)
            .ok_or_else(|| Error::PoolNotFound(name.to_string()))?;
        state.pools.remove(&id);
        Ok(())
    }

    pub fn pool_id(&self, name: &str) -> Option<PoolId> {
        self.shared.state.lock().pool_id_by_name(name)
    }

    pub fn create_namespace(&self, pool: PoolId, namespace: &str) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.pool_mut(pool)?.namespaces.insert(namespace.to_string());
        Ok(())
    }

    /// Create a block image and return its id
    pub fn create_image(&self, pool: PoolId, namespace: &str, name: &str, size: u64) -> Result<String> {
        let mut state = self.shared.state.lock();
        let pool = state.pool_mut(pool)?;
        if !namespace.is_empty() && !pool.namespaces.contains(namespace) {
            return Err(Error::NotFound(format!("namespace {namespace}")));
        }
        if pool.image_by_name(namespace, name).is_some() {
            return Err(Error::AlreadyExists(format!("image {name}")));
        }
        let id = format!("{:x}{:08x}", pool.id, pool.next_image_seq);
        pool.next_image_seq += 1;
        pool.images.insert(
            id.clone(),
            MemImage {
                id: id.clone(),
                name: name.to_string(),
                namespace: namespace.to_string(),
                size,
                snaps: Vec::new(),
            },
        );
        Ok(id)
    }

    /// Add a snapshot outside the user namespace (trash, mirror, group)
    pub fn add_image_snapshot(
        &self,
        pool: PoolId,
        image_id: &str,
        name: &str,
        namespace_type: SnapNamespaceType,
    ) -> Result<SnapId> {
        let mut state = self.shared.state.lock();
        let pool = state.pool_mut(pool)?;
        let id = pool.next_snap_id;
        let image = pool
            .images
            .get_mut(image_id)
            .ok_or_else(|| Error::ImageNotFound(image_id.to_string()))?;
        image.snaps.push(MemSnap {
            id,
            name: name.to_string(),
            size: image.size,
            namespace_type,
        });
        pool.next_snap_id += 1;
        Ok(id)
    }

    /// Raw object bytes, for assertions
    pub fn object_data(&self, pool: PoolId, oid: &str) -> Option<Vec<u8>> {
        let state = self.shared.state.lock();
        state
            .pools
            .get(&pool)?
            .objects
            .get(&(String::new(), oid.to_string()))
            .map(|o| o.data.clone())
    }

    /// Replace the rendered `df` report with fixed text
    pub fn set_df_text(&self, text: Option<String>) {
        self.shared.state.lock().df_override = text;
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().connected
    }

    // Failure injection

    /// Fail the next `n` connect calls
    pub fn fail_next_connects(&self, n: u32) {
        self.shared.faults.lock().connect_failures = n;
    }

    /// Make every monitor command fail with `code` (None clears)
    pub fn fail_mon_command(&self, code: Option<i32>) {
        self.shared.faults.lock().mon_command_error = code;
    }

    /// Make pool stat for `pool` fail with `code` (None clears)
    pub fn fail_pool_stat(&self, pool: PoolId, code: Option<i32>) {
        let mut faults = self.shared.faults.lock();
        match code {
            Some(code) => {
                faults.pool_stat_errors.insert(pool, code);
            }
            None => {
                faults.pool_stat_errors.remove(&pool);
            }
        }
    }

    // Counters

    pub fn connect_calls(&self) -> u64 {
        self.shared.counters.connect.load(Ordering::Relaxed)
    }

    pub fn shutdown_calls(&self) -> u64 {
        self.shared.counters.shutdown.load(Ordering::Relaxed)
    }

    pub fn ioctx_create_calls(&self) -> u64 {
        self.shared.counters.ioctx_create.load(Ordering::Relaxed)
    }

    pub fn ioctx_close_calls(&self) -> u64 {
        self.shared.counters.ioctx_close.load(Ordering::Relaxed)
    }

    pub fn mon_command_calls(&self) -> u64 {
        self.shared.counters.mon_command.load(Ordering::Relaxed)
    }

    pub fn pool_stat_calls(&self) -> u64 {
        self.shared.counters.pool_stat.load(Ordering::Relaxed)
    }

    fn open_ioctx(&self, id: PoolId, name: String) -> Arc<dyn IoCtx> {
        Arc::new(MemIoCtx {
            shared: Arc::clone(&self.shared),
            pool_id: id,
            pool_name: name,
            namespace: Mutex::new(String::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Render the `df` report
    #[must_use]
    pub fn render_df(&self) -> String {
        let state = self.shared.state.lock();
        if let Some(text) = &state.df_override {
            return text.clone();
        }
        render_df(&state)
    }
}

impl ClusterClient for MemCluster {
    fn conf_read_file(&self, path: &Path) -> Result<()> {
        if path.as_os_str().is_empty() {
            return Err(Error::invalid_argument("empty conf path"));
        }
        self.shared.state.lock().conf_file = Some(path.display().to_string());
        Ok(())
    }

    fn conf_set(&self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() {
            return Err(Error::invalid_argument("empty option name"));
        }
        self.shared
            .state
            .lock()
            .conf
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn conf_get(&self, key: &str) -> Result<String> {
        self.shared
            .state
            .lock()
            .conf
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("option {key}")))
    }

    fn connect(&self) -> Result<()> {
        self.shared.counters.connect.fetch_add(1, Ordering::Relaxed);
        {
            let mut faults = self.shared.faults.lock();
            if faults.connect_failures > 0 {
                faults.connect_failures -= 1;
                return Err(Error::cluster("connect", -libc::ETIMEDOUT));
            }
        }
        self.shared.state.lock().connected = true;
        Ok(())
    }

    fn shutdown(&self) {
        self.shared.counters.shutdown.fetch_add(1, Ordering::Relaxed);
        self.shared.state.lock().connected = false;
    }

    fn ioctx_create(&self, pool: &str) -> Result<Arc<dyn IoCtx>> {
        self.shared.counters.ioctx_create.fetch_add(1, Ordering::Relaxed);
        let id = self
            .shared
            .state
            .lock()
            .pool_id_by_name(pool)
            .ok_or_else(|| Error::PoolNotFound(pool.to_string()))?;
        Ok(self.open_ioctx(id, pool.to_string()))
    }

    fn ioctx_create_by_id(&self, pool: PoolId) -> Result<Arc<dyn IoCtx>> {
        self.shared.counters.ioctx_create.fetch_add(1, Ordering::Relaxed);
        let name = self.shared.state.lock().pool(pool)?.name.clone();
        Ok(self.open_ioctx(pool, name))
    }

    fn mon_command(&self, cmd: &str) -> Result<MonCommandOutput> {
        self.shared.counters.mon_command.fetch_add(1, Ordering::Relaxed);
        if let Some(code) = self.shared.faults.lock().mon_command_error {
            return Err(Error::cluster("mon_command", code));
        }
        let parsed: serde_json::Value = serde_json::from_str(cmd)
            .map_err(|e| Error::invalid_argument(format!("bad command json: {e}")))?;
        match parsed.get("prefix").and_then(serde_json::Value::as_str) {
            Some("df") => Ok(MonCommandOutput {
                outbuf: self.render_df().into_bytes(),
                outs: String::new(),
            }),
            Some(other) => Err(Error::NotSupported(format!("command {other}"))),
            None => Err(Error::invalid_argument("command without prefix")),
        }
    }

    fn cluster_stat(&self) -> Result<ClusterStat> {
        let state = self.shared.state.lock();
        let used = state.raw_used();
        Ok(ClusterStat {
            kb: state.capacity / 1024,
            kb_used: used / 1024,
            kb_avail: state.capacity.saturating_sub(used) / 1024,
            num_objects: state.pools.values().map(|p| p.objects.len() as u64).sum(),
        })
    }
}

struct MemIoCtx {
    shared: Arc<Shared>,
    pool_id: PoolId,
    pool_name: String,
    namespace: Mutex<String>,
    closed: AtomicBool,
}

impl MemIoCtx {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::cluster("closed ioctx", -libc::EBADF));
        }
        Ok(())
    }

    fn object_key(&self, oid: &str) -> (String, String) {
        (self.namespace.lock().clone(), oid.to_string())
    }

    fn open_image_where<F>(&self, what: &str, pred: F) -> Result<Box<dyn Image>>
    where
        F: Fn(&MemImage) -> bool,
    {
        self.check_open()?;
        let namespace = self.namespace.lock().clone();
        let state = self.shared.state.lock();
        let pool = state.pool(self.pool_id)?;
        let image = pool
            .images
            .values()
            .find(|i| i.namespace == namespace && pred(i))
            .ok_or_else(|| Error::ImageNotFound(what.to_string()))?;
        Ok(Box::new(MemImageHandle {
            shared: Arc::clone(&self.shared),
            pool_id: self.pool_id,
            image_id: image.id.clone(),
        }))
    }
}

impl IoCtx for MemIoCtx {
    fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    fn pool_name(&self) -> String {
        self.pool_name.clone()
    }

    fn namespace(&self) -> String {
        self.namespace.lock().clone()
    }

    fn set_namespace(&self, namespace: &str) {
        *self.namespace.lock() = namespace.to_string();
    }

    fn namespace_exists(&self, namespace: &str) -> Result<bool> {
        self.check_open()?;
        let state = self.shared.state.lock();
        Ok(state.pool(self.pool_id)?.namespaces.contains(namespace))
    }

    fn set_osdmap_full_try(&self) {}

    fn pool_stat(&self) -> Result<PoolStat> {
        self.check_open()?;
        self.shared.counters.pool_stat.fetch_add(1, Ordering::Relaxed);
        if let Some(code) = self.shared.faults.lock().pool_stat_errors.get(&self.pool_id) {
            return Err(Error::cluster("pool_stat", *code));
        }
        let state = self.shared.state.lock();
        let pool = state.pool(self.pool_id)?;
        let num_objects = pool.objects.len() as u64;
        let num_bytes = pool.stored_bytes();
        Ok(PoolStat {
            num_bytes,
            num_kb: num_bytes.div_ceil(1024),
            num_objects,
            num_object_copies: num_objects * u64::from(pool.replicas),
            ..PoolStat::default()
        })
    }

    fn operate_write(&self, oid: &str, op: &WriteOp) -> Result<()> {
        self.check_open()?;
        let key = self.object_key(oid);
        let mut state = self.shared.state.lock();
        let pool = state.pool_mut(self.pool_id)?;
        let current = pool.objects.get(&key).cloned();
        let staged = apply_write(oid, current, op)?;
        match staged {
            Some(obj) => {
                pool.objects.insert(key, obj);
            }
            None => {
                pool.objects.remove(&key);
            }
        }
        Ok(())
    }

    fn operate_read(&self, oid: &str, op: &ReadOp) -> Result<ReadOpOutput> {
        self.check_open()?;
        let key = self.object_key(oid);
        let state = self.shared.state.lock();
        let pool = state.pool(self.pool_id)?;
        let obj = pool.objects.get(&key);
        apply_read(oid, obj, op)
    }

    fn open_image(&self, name: &str) -> Result<Box<dyn Image>> {
        self.open_image_where(name, |i| i.name == name)
    }

    fn open_image_by_id(&self, id: &str) -> Result<Box<dyn Image>> {
        self.open_image_where(id, |i| i.id == id)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shared.counters.ioctx_close.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

fn to_usize(v: u64) -> Result<usize> {
    usize::try_from(v).map_err(|_| Error::invalid_argument("offset overflow"))
}

/// End of `[offset, offset + len)`, bounded by [`MAX_OBJECT_SIZE`]
fn extent_end(op: &str, offset: u64, len: u64) -> Result<usize> {
    match offset.checked_add(len) {
        Some(end) if end <= MAX_OBJECT_SIZE => to_usize(end),
        _ => Err(Error::cluster(op, -libc::EFBIG)),
    }
}

/// Clamp `[offset, offset + len)` to `size`; a zero `len` runs to the end
fn clamp_range(offset: u64, len: u64, size: usize) -> (usize, usize) {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(size);
    let end = if len == 0 {
        size
    } else {
        usize::try_from(offset.saturating_add(len))
            .unwrap_or(usize::MAX)
            .min(size)
    };
    (start, end)
}

fn check_guard(index: usize, guard: &Guard, oid: &str, obj: Option<&MemObject>) -> Result<()> {
    let obj = obj.ok_or_else(|| Error::ObjectNotFound(oid.to_string()))?;
    match guard {
        Guard::AssertExists => Ok(()),
        Guard::AssertVersion(v) => {
            if *v == obj.version {
                Ok(())
            } else if *v < obj.version {
                Err(Error::cluster("assert_version", -libc::ERANGE))
            } else {
                Err(Error::cluster("assert_version", -libc::EOVERFLOW))
            }
        }
        Guard::CmpExt { offset, data } => {
            let start = to_usize(*offset)?;
            for (i, expected) in data.iter().enumerate() {
                let actual = start
                    .checked_add(i)
                    .and_then(|at| obj.data.get(at))
                    .copied()
                    .unwrap_or(0);
                if actual != *expected {
                    let pos = i32::try_from(i).unwrap_or(i32::MAX - MAX_ERRNO);
                    return Err(Error::CompareMismatch {
                        index,
                        code: -(MAX_ERRNO + pos),
                    });
                }
            }
            Ok(())
        }
        Guard::CmpXattr { name, op, value } => {
            let stored = obj
                .xattrs
                .get(name)
                .ok_or_else(|| Error::cluster("cmpxattr", -libc::ENODATA))?;
            if op.holds(stored, value) {
                Ok(())
            } else {
                Err(Error::CompareMismatch {
                    index,
                    code: -libc::ECANCELED,
                })
            }
        }
        Guard::OmapCmp { key, op, value } => {
            let stored = obj.omap.get(key).map_or(&[][..], |v| &v[..]);
            if op.holds(stored, value) {
                Ok(())
            } else {
                Err(Error::CompareMismatch {
                    index,
                    code: -libc::ECANCELED,
                })
            }
        }
    }
}

fn apply_write(oid: &str, current: Option<MemObject>, op: &WriteOp) -> Result<Option<MemObject>> {
    let mut obj = current;
    let mut mutated = false;
    for (index, sub) in op.ops.iter().enumerate() {
        mutated |= sub.is_mutation();
        match sub {
            WriteSubOp::Guard(guard) => check_guard(index, guard, oid, obj.as_ref())?,
            WriteSubOp::Create { exclusive } => {
                if obj.is_some() && *exclusive {
                    return Err(Error::AlreadyExists(oid.to_string()));
                }
                obj.get_or_insert_with(MemObject::default);
            }
            WriteSubOp::SetXattr { name, value } => {
                obj.get_or_insert_with(MemObject::default)
                    .xattrs
                    .insert(name.clone(), value.clone());
            }
            WriteSubOp::RmXattr { name } => {
                let o = obj.as_mut().ok_or_else(|| Error::ObjectNotFound(oid.to_string()))?;
                if o.xattrs.remove(name).is_none() {
                    return Err(Error::cluster("rmxattr", -libc::ENODATA));
                }
            }
            WriteSubOp::Write { offset, data } => {
                let end = extent_end("write", *offset, data.len() as u64)?;
                let start = to_usize(*offset)?;
                let o = obj.get_or_insert_with(MemObject::default);
                if o.data.len() < end {
                    o.data.resize(end, 0);
                }
                o.data[start..end].copy_from_slice(data);
            }
            WriteSubOp::WriteFull { data } => {
                extent_end("write_full", 0, data.len() as u64)?;
                obj.get_or_insert_with(MemObject::default).data = data.to_vec();
            }
            WriteSubOp::WriteSame {
                offset,
                write_len,
                data,
            } => {
                let total = to_usize(*write_len)?;
                if data.is_empty() || total % data.len() != 0 {
                    return Err(Error::invalid_argument(
                        "write_same length is not a multiple of the pattern",
                    ));
                }
                let end = extent_end("write_same", *offset, *write_len)?;
                let start = to_usize(*offset)?;
                let o = obj.get_or_insert_with(MemObject::default);
                if o.data.len() < end {
                    o.data.resize(end, 0);
                }
                for chunk in o.data[start..end].chunks_mut(data.len()) {
                    chunk.copy_from_slice(data);
                }
            }
            WriteSubOp::Append { data } => {
                let o = obj.get_or_insert_with(MemObject::default);
                extent_end("append", o.data.len() as u64, data.len() as u64)?;
                o.data.extend_from_slice(data);
            }
            WriteSubOp::Remove => {
                if obj.take().is_none() {
                    return Err(Error::ObjectNotFound(oid.to_string()));
                }
            }
            WriteSubOp::Truncate { size } => {
                let size = extent_end("truncate", *size, 0)?;
                obj.get_or_insert_with(MemObject::default).data.resize(size, 0);
            }
            WriteSubOp::Zero { offset, len } => {
                extent_end("zero", *offset, *len)?;
                let o = obj.as_mut().ok_or_else(|| Error::ObjectNotFound(oid.to_string()))?;
                if *len != 0 {
                    let (start, end) = clamp_range(*offset, *len, o.data.len());
                    o.data[start..end].fill(0);
                }
            }
            WriteSubOp::OmapSet { entries } => {
                let o = obj.get_or_insert_with(MemObject::default);
                for (k, v) in entries {
                    o.omap.insert(k.clone(), v.clone());
                }
            }
            WriteSubOp::OmapRmKeys { keys } => {
                let o = obj.as_mut().ok_or_else(|| Error::ObjectNotFound(oid.to_string()))?;
                for k in keys {
                    o.omap.remove(k);
                }
            }
            WriteSubOp::OmapClear => {
                let o = obj.as_mut().ok_or_else(|| Error::ObjectNotFound(oid.to_string()))?;
                o.omap.clear();
            }
            WriteSubOp::SetAllocHint { .. } => {}
        }
    }
    if mutated {
        if let Some(o) = obj.as_mut() {
            o.version += 1;
            o.mtime = now_secs();
        }
    }
    Ok(obj)
}

fn apply_read(oid: &str, obj: Option<&MemObject>, op: &ReadOp) -> Result<ReadOpOutput> {
    let obj = obj.ok_or_else(|| Error::ObjectNotFound(oid.to_string()))?;
    let mut results = Vec::with_capacity(op.ops.len());
    for (index, sub) in op.ops.iter().enumerate() {
        let result = match sub {
            ReadSubOp::Guard(guard) => {
                check_guard(index, guard, oid, Some(obj))?;
                SubOpResult::default()
            }
            ReadSubOp::Stat => SubOpResult {
                rval: 0,
                data: ReadData::Stat {
                    size: obj.data.len() as u64,
                    mtime: obj.mtime,
                },
            },
            ReadSubOp::Read { offset, len } => {
                let (start, end) = clamp_range(*offset, *len, obj.data.len());
                SubOpResult {
                    rval: 0,
                    data: ReadData::Bytes(Bytes::copy_from_slice(&obj.data[start..end])),
                }
            }
            ReadSubOp::GetXattr { name } => match obj.xattrs.get(name) {
                Some(v) => SubOpResult {
                    rval: 0,
                    data: ReadData::Bytes(v.clone()),
                },
                None => SubOpResult {
                    rval: -libc::ENODATA,
                    data: ReadData::None,
                },
            },
            ReadSubOp::GetXattrs => SubOpResult {
                rval: 0,
                data: ReadData::Xattrs(obj.xattrs.clone()),
            },
            ReadSubOp::OmapGetKeys { start_after, max } => {
                let (vals, more) = omap_page(&obj.omap, start_after, "", *max);
                SubOpResult {
                    rval: 0,
                    data: ReadData::Keys {
                        keys: vals.into_keys().collect(),
                        more,
                    },
                }
            }
            ReadSubOp::OmapGetVals {
                start_after,
                filter_prefix,
                max,
            } => {
                let (vals, more) = omap_page(&obj.omap, start_after, filter_prefix, *max);
                SubOpResult {
                    rval: 0,
                    data: ReadData::Vals { vals, more },
                }
            }
            ReadSubOp::OmapGetValsByKeys { keys } => {
                let vals = keys
                    .iter()
                    .filter_map(|k| obj.omap.get(k).map(|v| (k.clone(), v.clone())))
                    .collect();
                SubOpResult {
                    rval: 0,
                    data: ReadData::Vals { vals, more: false },
                }
            }
            ReadSubOp::Checksum {
                kind,
                init_value,
                offset,
                len,
                chunk_size,
            } => match checksum_chunks(*kind, *init_value, &obj.data, *offset, *len, *chunk_size) {
                Ok(sums) => SubOpResult {
                    rval: 0,
                    data: ReadData::Checksums(sums),
                },
                Err(e) => SubOpResult {
                    rval: e.errno(),
                    data: ReadData::None,
                },
            },
        };
        results.push(result);
    }
    Ok(ReadOpOutput { results })
}

fn omap_page(
    omap: &BTreeMap<String, Bytes>,
    start_after: &str,
    prefix: &str,
    max: u64,
) -> (BTreeMap<String, Bytes>, bool) {
    let max = usize::try_from(max).unwrap_or(usize::MAX);
    let mut matching = omap
        .iter()
        .filter(|(k, _)| k.as_str() > start_after && k.starts_with(prefix));
    let page: BTreeMap<String, Bytes> = matching
        .by_ref()
        .take(max)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let more = matching.next().is_some();
    (page, more)
}

struct MemImageHandle {
    shared: Arc<Shared>,
    pool_id: PoolId,
    image_id: String,
}

impl MemImageHandle {
    fn with_image<T>(&self, f: impl FnOnce(&MemImage) -> Result<T>) -> Result<T> {
        let state = self.shared.state.lock();
        let image = state
            .pool(self.pool_id)?
            .images
            .get(&self.image_id)
            .ok_or_else(|| Error::ImageNotFound(self.image_id.clone()))?;
        f(image)
    }

    fn with_pool_mut<T>(&self, f: impl FnOnce(&mut MemPool) -> Result<T>) -> Result<T> {
        let mut state = self.shared.state.lock();
        let pool = state.pool_mut(self.pool_id)?;
        if !pool.images.contains_key(&self.image_id) {
            return Err(Error::ImageNotFound(self.image_id.clone()));
        }
        f(pool)
    }
}

impl Image for MemImageHandle {
    fn name(&self) -> String {
        self.with_image(|i| Ok(i.name.clone())).unwrap_or_default()
    }

    fn id(&self) -> String {
        self.image_id.clone()
    }

    fn snap_list(&self) -> Result<Vec<ImageSnap>> {
        self.with_image(|i| {
            Ok(i.snaps
                .iter()
                .map(|s| ImageSnap {
                    id: s.id,
                    name: s.name.clone(),
                    size: s.size,
                })
                .collect())
        })
    }

    fn snap_namespace_type(&self, snap: SnapId) -> Result<SnapNamespaceType> {
        self.with_image(|i| {
            i.snaps
                .iter()
                .find(|s| s.id == snap)
                .map(|s| s.namespace_type)
                .ok_or_else(|| Error::SnapshotNotFound(snap.to_string()))
        })
    }

    fn snap_create(&self, name: &str) -> Result<()> {
        self.with_pool_mut(|pool| {
            let id = pool.next_snap_id;
            let image_id = self.image_id.clone();
            let image = pool
                .images
                .get_mut(&image_id)
                .ok_or_else(|| Error::ImageNotFound(image_id.clone()))?;
            if image
                .snaps
                .iter()
                .any(|s| s.name == name && s.namespace_type == SnapNamespaceType::User)
            {
                return Err(Error::AlreadyExists(format!("snapshot {name}")));
            }
            image.snaps.push(MemSnap {
                id,
                name: name.to_string(),
                size: image.size,
                namespace_type: SnapNamespaceType::User,
            });
            pool.next_snap_id += 1;
            Ok(())
        })
    }

    fn snap_remove(&self, name: &str, _force: bool) -> Result<()> {
        self.with_pool_mut(|pool| {
            let image = pool
                .images
                .get_mut(&self.image_id)
                .ok_or_else(|| Error::ImageNotFound(self.image_id.clone()))?;
            let before = image.snaps.len();
            image
                .snaps
                .retain(|s| !(s.name == name && s.namespace_type == SnapNamespaceType::User));
            if image.snaps.len() == before {
                return Err(Error::SnapshotNotFound(name.to_string()));
            }
            Ok(())
        })
    }

    fn snap_remove_by_id(&self, snap: SnapId) -> Result<()> {
        self.with_pool_mut(|pool| {
            let image = pool
                .images
                .get_mut(&self.image_id)
                .ok_or_else(|| Error::ImageNotFound(self.image_id.clone()))?;
            let before = image.snaps.len();
            image.snaps.retain(|s| s.id != snap);
            if image.snaps.len() == before {
                return Err(Error::SnapshotNotFound(snap.to_string()));
            }
            Ok(())
        })
    }
}

const BYTE_UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

/// Format a byte count the way the cluster's report does (`10.5 GiB`)
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    let mut unit = 0;
    let mut scaled = bytes as f64;
    while scaled >= 1024.0 && unit < BYTE_UNITS.len() - 1 {
        scaled /= 1024.0;
        unit += 1;
    }
    format!("{} {}", trim_decimal(scaled), BYTE_UNITS[unit])
}

/// Format an object count with a `k` or `M` suffix
#[must_use]
pub fn format_count(count: u64) -> String {
    if count < 1000 {
        count.to_string()
    } else if count < 1_000_000 {
        format!("{}k", trim_decimal(count as f64 / 1000.0))
    } else {
        format!("{}M", trim_decimal(count as f64 / 1_000_000.0))
    }
}

fn trim_decimal(v: f64) -> String {
    let s = format!("{v:.2}");
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

fn render_df(state: &MemState) -> String {
    let capacity = state.capacity;
    let raw_used = state.raw_used();
    let raw_avail = capacity.saturating_sub(raw_used);
    let raw_pct = if capacity == 0 {
        0.0
    } else {
        raw_used as f64 * 100.0 / capacity as f64
    };

    let mut out = String::new();
    let _ = writeln!(out, "--- RAW STORAGE ---");
    let _ = writeln!(out, "CLASS     SIZE    AVAIL     USED  RAW USED  %RAW USED");
    for class in ["hdd", "TOTAL"] {
        let _ = writeln!(
            out,
            "{class:<6} {}  {}  {}  {}  {raw_pct:.2}",
            format_bytes(capacity),
            format_bytes(raw_avail),
            format_bytes(raw_used),
            format_bytes(raw_used),
        );
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "--- POOLS ---");
    let _ = writeln!(out, "POOL  ID  PGS  STORED  OBJECTS  USED  %USED  MAX AVAIL");
    for pool in state.pools.values() {
        let used = pool.used_bytes();
        let max_avail = raw_avail / u64::from(pool.replicas);
        let pct = if used + raw_avail == 0 {
            0.0
        } else {
            used as f64 * 100.0 / (used + raw_avail) as f64
        };
        let _ = writeln!(
            out,
            "{:<12} {:>3} {:>4} {:>10} {:>8} {:>10} {:>6.2} {:>10}",
            pool.name,
            pool.id,
            DEFAULT_PGS,
            format_bytes(pool.stored_bytes()),
            format_count(pool.objects.len() as u64),
            format_bytes(used),
            pct,
            format_bytes(max_avail),
        );
    }
    out
}
