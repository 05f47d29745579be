//! Messenger wire model
//!
//! Each frame on a connection is one bincode-encoded message: clients send
//! [`ClientRequest`], the adaptor answers with [`OpReply`] carrying the same
//! `tid`. Framing (a length prefix per message) is the messenger's job.

use bytes::Bytes;
use radosproxy_common::{Error, PoolId, Result, SnapId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Sub-operation code
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    // Reads and guards
    Read,
    SparseRead,
    Stat,
    GetXattr,
    GetXattrs,
    CmpXattr,
    CmpExt,
    AssertExists,
    AssertVersion,
    OmapGetKeys,
    OmapGetVals,
    OmapGetValsByKeys,
    OmapCmp,
    Checksum,
    // Writes
    Create,
    Write,
    WriteFull,
    WriteSame,
    Append,
    Delete,
    Truncate,
    Zero,
    SetXattr,
    RmXattr,
    OmapSetVals,
    OmapRmKeys,
    OmapClear,
    SetAllocHint,
}

impl OpCode {
    /// Whether the sub-op modifies the object
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(
            self,
            Self::Create
                | Self::Write
                | Self::WriteFull
                | Self::WriteSame
                | Self::Append
                | Self::Delete
                | Self::Truncate
                | Self::Zero
                | Self::SetXattr
                | Self::RmXattr
                | Self::OmapSetVals
                | Self::OmapRmKeys
                | Self::OmapClear
                | Self::SetAllocHint
        )
    }
}

/// One sub-operation as sent by a client.
///
/// Field use depends on `code`:
///
/// | code | fields |
/// |---|---|
/// | `Read`, `SparseRead`, `Zero` | `offset`, `length` |
/// | `Write`, `CmpExt` | `offset`, `indata` |
/// | `WriteFull`, `Append` | `indata` |
/// | `WriteSame` | `offset`, `length` (total), `indata` (pattern) |
/// | `Truncate` | `offset` (new size) |
/// | `Create` | `arg` non-zero for exclusive |
/// | `AssertVersion` | `arg` (version) |
/// | `GetXattr`, `RmXattr` | `name` |
/// | `SetXattr` | `name`, `indata` |
/// | `CmpXattr`, `OmapCmp` | `name`, `arg` (operator 1-6), `indata` |
/// | `OmapGetKeys` | `name` (start after), `length` (max) |
/// | `OmapGetVals` | `name` (start after), `prefix`, `length` (max) |
/// | `OmapGetValsByKeys`, `OmapRmKeys` | `keys` |
/// | `OmapSetVals` | `entries` |
/// | `Checksum` | `offset`, `length`, `arg` (0 xxhash32, 1 xxhash64, 2 crc32c), `aux` (chunk size), `indata` (8-byte LE seed) |
/// | `SetAllocHint` | `offset` (object size), `length` (write size), `arg` (flags) |
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientOp {
    pub code: OpCode,
    pub offset: u64,
    pub length: u64,
    pub arg: u64,
    pub aux: u64,
    pub name: String,
    pub prefix: String,
    pub indata: Vec<u8>,
    pub keys: Vec<String>,
    pub entries: Vec<(String, Vec<u8>)>,
}

impl ClientOp {
    #[must_use]
    pub const fn new(code: OpCode) -> Self {
        Self {
            code,
            offset: 0,
            length: 0,
            arg: 0,
            aux: 0,
            name: String::new(),
            prefix: String::new(),
            indata: Vec::new(),
            keys: Vec::new(),
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn extent(mut self, offset: u64, length: u64) -> Self {
        self.offset = offset;
        self.length = length;
        self
    }

    #[must_use]
    pub fn arg(mut self, arg: u64) -> Self {
        self.arg = arg;
        self
    }

    #[must_use]
    pub fn aux(mut self, aux: u64) -> Self {
        self.aux = aux;
        self
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.indata = data.into();
        self
    }

    #[must_use]
    pub fn keys<K: Into<String>>(mut self, keys: impl IntoIterator<Item = K>) -> Self {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn entries<K, V>(mut self, entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        self.entries = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    pub fn read(offset: u64, length: u64) -> Self {
        Self::new(OpCode::Read).extent(offset, length)
    }

    pub fn write(offset: u64, data: impl Into<Vec<u8>>) -> Self {
        Self::new(OpCode::Write).extent(offset, 0).data(data)
    }

    pub fn stat() -> Self {
        Self::new(OpCode::Stat)
    }
}

/// A client request: sub-operations against one object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    /// Client transaction id, echoed in the reply
    pub tid: u64,
    pub pool_id: PoolId,
    /// Placement seed of the object's placement group
    pub pg_seed: u32,
    pub snap_id: SnapId,
    pub object: String,
    pub ops: Vec<ClientOp>,
}

/// Payload of one sub-op reply
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyData {
    #[default]
    None,
    Bytes(Vec<u8>),
    /// Sparse read: `(offset, length)` extents followed by their data
    Extents { extents: Vec<(u64, u64)>, data: Vec<u8> },
    Stat { size: u64, mtime: u64 },
    Keys { keys: Vec<String>, more: bool },
    Vals { vals: Vec<(String, Vec<u8>)>, more: bool },
    Xattrs(Vec<(String, Vec<u8>)>),
    Checksums(Vec<u64>),
}

/// Result of one sub-op
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpOutput {
    pub rval: i32,
    pub data: ReplyData,
}

/// Reply to one [`ClientRequest`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpReply {
    pub tid: u64,
    /// 0 or a negative errno
    pub result: i32,
    pub ops: Vec<OpOutput>,
}

impl OpReply {
    /// Reply with a status and no per-op output
    #[must_use]
    pub const fn status(tid: u64, result: i32) -> Self {
        Self {
            tid,
            result,
            ops: Vec::new(),
        }
    }
}

/// Serialize one message body
pub fn encode<T: Serialize>(msg: &T) -> Result<Bytes> {
    bincode::serialize(msg)
        .map(Bytes::from)
        .map_err(|e| Error::Serialization(e.to_string()))
}

/// Deserialize one message body
pub fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T> {
    bincode::deserialize(buf).map_err(|e| Error::Serialization(e.to_string()))
}
