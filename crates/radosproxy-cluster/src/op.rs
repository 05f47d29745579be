//! Typed object operation batches
//!
//! A [`WriteOp`] or [`ReadOp`] collects sub-operations against one object.
//! Write batches apply atomically; read batches return one result per
//! sub-operation.

use bytes::Bytes;
use radosproxy_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Offset added to the mismatch position in a failed extent compare
pub const MAX_ERRNO: i32 = 4095;

/// Comparison operator for xattr and omap guards
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CmpOp {
    /// Decode the cluster's numeric operator encoding (1 = EQ .. 6 = LTE)
    pub fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            1 => Ok(Self::Eq),
            2 => Ok(Self::Ne),
            3 => Ok(Self::Gt),
            4 => Ok(Self::Gte),
            5 => Ok(Self::Lt),
            6 => Ok(Self::Lte),
            other => Err(Error::invalid_argument(format!("unknown compare operator {other}"))),
        }
    }

    /// Whether `stored` compared to `expected` satisfies this operator
    #[must_use]
    pub fn holds(self, stored: &[u8], expected: &[u8]) -> bool {
        let ord = stored.cmp(expected);
        match self {
            Self::Eq => ord == Ordering::Equal,
            Self::Ne => ord != Ordering::Equal,
            Self::Gt => ord == Ordering::Greater,
            Self::Gte => ord != Ordering::Less,
            Self::Lt => ord == Ordering::Less,
            Self::Lte => ord != Ordering::Greater,
        }
    }
}

/// Checksum algorithm for checksum reads
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumType {
    XxHash32,
    XxHash64,
    Crc32c,
}

impl ChecksumType {
    /// Checksum `data` seeded with `init`
    #[must_use]
    pub fn compute(self, data: &[u8], init: u64) -> u64 {
        match self {
            Self::XxHash32 => {
                u64::from(xxhash_rust::xxh32::xxh32(data, init as u32))
            }
            Self::XxHash64 => xxhash_rust::xxh64::xxh64(data, init),
            Self::Crc32c => u64::from(crc32c::crc32c_append(init as u32, data)),
        }
    }
}

/// Guard evaluated before a batch runs. Shared by read and write batches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Guard {
    AssertExists,
    AssertVersion(u64),
    CmpExt { offset: u64, data: Bytes },
    CmpXattr { name: String, op: CmpOp, value: Bytes },
    OmapCmp { key: String, op: CmpOp, value: Bytes },
}

/// One mutation inside a write batch
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteSubOp {
    Guard(Guard),
    SetXattr { name: String, value: Bytes },
    RmXattr { name: String },
    Create { exclusive: bool },
    Write { offset: u64, data: Bytes },
    WriteFull { data: Bytes },
    WriteSame { offset: u64, write_len: u64, data: Bytes },
    Append { data: Bytes },
    Remove,
    Truncate { size: u64 },
    Zero { offset: u64, len: u64 },
    OmapSet { entries: Vec<(String, Bytes)> },
    OmapRmKeys { keys: Vec<String> },
    OmapClear,
    SetAllocHint { expected_object_size: u64, expected_write_size: u64, flags: u32 },
}

impl WriteSubOp {
    /// Sub-ops that modify object data or metadata
    #[must_use]
    pub const fn is_mutation(&self) -> bool {
        !matches!(self, Self::Guard(_) | Self::SetAllocHint { .. })
    }
}

/// Atomic write batch against one object
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteOp {
    pub flags: u32,
    pub ops: Vec<WriteSubOp>,
}

impl WriteOp {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_flags(&mut self, flags: u32) -> &mut Self {
        self.flags = flags;
        self
    }

    pub fn assert_exists(&mut self) -> &mut Self {
        self.push(WriteSubOp::Guard(Guard::AssertExists))
    }

    pub fn assert_version(&mut self, version: u64) -> &mut Self {
        self.push(WriteSubOp::Guard(Guard::AssertVersion(version)))
    }

    pub fn cmpext(&mut self, offset: u64, data: impl Into<Bytes>) -> &mut Self {
        self.push(WriteSubOp::Guard(Guard::CmpExt {
            offset,
            data: data.into(),
        }))
    }

    pub fn cmpxattr(&mut self, name: &str, op: CmpOp, value: impl Into<Bytes>) -> &mut Self {
        self.push(WriteSubOp::Guard(Guard::CmpXattr {
            name: name.to_string(),
            op,
            value: value.into(),
        }))
    }

    pub fn omap_cmp(&mut self, key: &str, op: CmpOp, value: impl Into<Bytes>) -> &mut Self {
        self.push(WriteSubOp::Guard(Guard::OmapCmp {
            key: key.to_string(),
            op,
            value: value.into(),
        }))
    }

    pub fn setxattr(&mut self, name: &str, value: impl Into<Bytes>) -> &mut Self {
        self.push(WriteSubOp::SetXattr {
            name: name.to_string(),
            value: value.into(),
        })
    }

    pub fn rmxattr(&mut self, name: &str) -> &mut Self {
        self.push(WriteSubOp::RmXattr {
            name: name.to_string(),
        })
    }

    pub fn create(&mut self, exclusive: bool) -> &mut Self {
        self.push(WriteSubOp::Create { exclusive })
    }

    pub fn write(&mut self, offset: u64, data: impl Into<Bytes>) -> &mut Self {
        self.push(WriteSubOp::Write {
            offset,
            data: data.into(),
        })
    }

    pub fn write_full(&mut self, data: impl Into<Bytes>) -> &mut Self {
        self.push(WriteSubOp::WriteFull { data: data.into() })
    }

    pub fn write_same(&mut self, offset: u64, write_len: u64, data: impl Into<Bytes>) -> &mut Self {
        self.push(WriteSubOp::WriteSame {
            offset,
            write_len,
            data: data.into(),
        })
    }

    pub fn append(&mut self, data: impl Into<Bytes>) -> &mut Self {
        self.push(WriteSubOp::Append { data: data.into() })
    }

    pub fn remove(&mut self) -> &mut Self {
        self.push(WriteSubOp::Remove)
    }

    pub fn truncate(&mut self, size: u64) -> &mut Self {
        self.push(WriteSubOp::Truncate { size })
    }

    pub fn zero(&mut self, offset: u64, len: u64) -> &mut Self {
        self.push(WriteSubOp::Zero { offset, len })
    }

    pub fn omap_set<K, V>(&mut self, entries: impl IntoIterator<Item = (K, V)>) -> &mut Self
    where
        K: Into<String>,
        V: Into<Bytes>,
    {
        let entries = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.push(WriteSubOp::OmapSet { entries })
    }

    pub fn omap_rm_keys<K: Into<String>>(&mut self, keys: impl IntoIterator<Item = K>) -> &mut Self {
        let keys = keys.into_iter().map(Into::into).collect();
        self.push(WriteSubOp::OmapRmKeys { keys })
    }

    pub fn omap_clear(&mut self) -> &mut Self {
        self.push(WriteSubOp::OmapClear)
    }

    pub fn set_alloc_hint(
        &mut self,
        expected_object_size: u64,
        expected_write_size: u64,
        flags: u32,
    ) -> &mut Self {
        self.push(WriteSubOp::SetAllocHint {
            expected_object_size,
            expected_write_size,
            flags,
        })
    }

    fn push(&mut self, op: WriteSubOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// One query inside a read batch
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadSubOp {
    Guard(Guard),
    Stat,
    Read { offset: u64, len: u64 },
    GetXattr { name: String },
    GetXattrs,
    OmapGetKeys { start_after: String, max: u64 },
    OmapGetVals { start_after: String, filter_prefix: String, max: u64 },
    OmapGetValsByKeys { keys: Vec<String> },
    Checksum { kind: ChecksumType, init_value: u64, offset: u64, len: u64, chunk_size: u64 },
}

/// Read batch against one object
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadOp {
    pub flags: u32,
    pub ops: Vec<ReadSubOp>,
}

impl ReadOp {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_flags(&mut self, flags: u32) -> &mut Self {
        self.flags = flags;
        self
    }

    pub fn assert_exists(&mut self) -> &mut Self {
        self.push(ReadSubOp::Guard(Guard::AssertExists))
    }

    pub fn assert_version(&mut self, version: u64) -> &mut Self {
        self.push(ReadSubOp::Guard(Guard::AssertVersion(version)))
    }

    pub fn cmpext(&mut self, offset: u64, data: impl Into<Bytes>) -> &mut Self {
        self.push(ReadSubOp::Guard(Guard::CmpExt {
            offset,
            data: data.into(),
        }))
    }

    pub fn cmpxattr(&mut self, name: &str, op: CmpOp, value: impl Into<Bytes>) -> &mut Self {
        self.push(ReadSubOp::Guard(Guard::CmpXattr {
            name: name.to_string(),
            op,
            value: value.into(),
        }))
    }

    pub fn omap_cmp(&mut self, key: &str, op: CmpOp, value: impl Into<Bytes>) -> &mut Self {
        self.push(ReadSubOp::Guard(Guard::OmapCmp {
            key: key.to_string(),
            op,
            value: value.into(),
        }))
    }

    pub fn stat(&mut self) -> &mut Self {
        self.push(ReadSubOp::Stat)
    }

    pub fn read(&mut self, offset: u64, len: u64) -> &mut Self {
        self.push(ReadSubOp::Read { offset, len })
    }

    pub fn getxattr(&mut self, name: &str) -> &mut Self {
        self.push(ReadSubOp::GetXattr {
            name: name.to_string(),
        })
    }

    pub fn getxattrs(&mut self) -> &mut Self {
        self.push(ReadSubOp::GetXattrs)
    }

    pub fn omap_get_keys(&mut self, start_after: &str, max: u64) -> &mut Self {
        self.push(ReadSubOp::OmapGetKeys {
            start_after: start_after.to_string(),
            max,
        })
    }

    pub fn omap_get_vals(&mut self, start_after: &str, filter_prefix: &str, max: u64) -> &mut Self {
        self.push(ReadSubOp::OmapGetVals {
            start_after: start_after.to_string(),
            filter_prefix: filter_prefix.to_string(),
            max,
        })
    }

    pub fn omap_get_vals_by_keys<K: Into<String>>(
        &mut self,
        keys: impl IntoIterator<Item = K>,
    ) -> &mut Self {
        let keys = keys.into_iter().map(Into::into).collect();
        self.push(ReadSubOp::OmapGetValsByKeys { keys })
    }

    pub fn checksum(
        &mut self,
        kind: ChecksumType,
        init_value: u64,
        offset: u64,
        len: u64,
        chunk_size: u64,
    ) -> &mut Self {
        self.push(ReadSubOp::Checksum {
            kind,
            init_value,
            offset,
            len,
            chunk_size,
        })
    }

    fn push(&mut self, op: ReadSubOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Payload returned by one read sub-op
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ReadData {
    #[default]
    None,
    Bytes(Bytes),
    Stat { size: u64, mtime: u64 },
    Xattrs(BTreeMap<String, Bytes>),
    Keys { keys: Vec<String>, more: bool },
    Vals { vals: BTreeMap<String, Bytes>, more: bool },
    Checksums(Vec<u64>),
}

/// Result of one read sub-op
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubOpResult {
    pub rval: i32,
    pub data: ReadData,
}

/// Results of a read batch, in sub-op order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadOpOutput {
    pub results: Vec<SubOpResult>,
}

/// Either kind of batch, as queued through the proxy
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpBatch {
    Write(WriteOp),
    Read(ReadOp),
}

impl OpBatch {
    #[must_use]
    pub const fn is_write(&self) -> bool {
        matches!(self, Self::Write(_))
    }
}

/// Split `len` bytes at `offset` of `data` into checksum chunks.
/// A zero chunk size checksums the range as one chunk.
pub fn checksum_chunks(
    kind: ChecksumType,
    init_value: u64,
    data: &[u8],
    offset: u64,
    len: u64,
    chunk_size: u64,
) -> Result<Vec<u64>> {
    let start = usize::try_from(offset).map_err(|_| Error::invalid_argument("offset overflow"))?;
    let len = usize::try_from(len).map_err(|_| Error::invalid_argument("length overflow"))?;
    let end = start
        .checked_add(len)
        .ok_or_else(|| Error::invalid_argument("range overflow"))?;
    if end > data.len() {
        return Err(Error::invalid_argument(format!(
            "checksum range {start}..{end} beyond object size {}",
            data.len()
        )));
    }
    let range = &data[start..end];
    if chunk_size == 0 {
        return Ok(vec![kind.compute(range, init_value)]);
    }
    let chunk = usize::try_from(chunk_size).map_err(|_| Error::invalid_argument("chunk overflow"))?;
    if len % chunk != 0 {
        return Err(Error::invalid_argument("length is not a multiple of chunk size"));
    }
    Ok(range.chunks(chunk).map(|c| kind.compute(c, init_value)).collect())
}
