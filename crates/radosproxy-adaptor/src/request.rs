//! Request normalisation
//!
//! Turns a [`ClientRequest`] off the wire into an [`OpRequest`]: sub-ops are
//! decoded into typed [`SubOp`]s, block-image data objects get their
//! [`RbdObjectId`] and the request is classified read or write.

use crate::wire::{ClientOp, ClientRequest, OpCode};
use bytes::Bytes;
use radosproxy_cluster::{ChecksumType, CmpOp};
use radosproxy_common::{Error, PoolId, Result, SnapId};

/// Snapshot id meaning "the head object"
pub const NOSNAP: SnapId = u64::MAX - 1;

const RBD_DATA_PREFIX: &str = "rbd_data";

/// Read or write request, decided by its sub-ops
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Image and object number decoded from `rbd_data.[<pool>.]<image>.<objno>`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RbdObjectId {
    pub head: u64,
    pub sequence: u64,
}

impl RbdObjectId {
    /// `None` for objects that are not image data. A data object name needs
    /// at least three dot-separated parts; the last two are hex.
    pub fn parse(object: &str) -> Result<Option<Self>> {
        let parts: Vec<&str> = object.split('.').filter(|p| !p.is_empty()).collect();
        if parts.first() != Some(&RBD_DATA_PREFIX) {
            return Ok(None);
        }
        let &[_, .., head, sequence] = parts.as_slice() else {
            return Err(Error::invalid_argument(format!(
                "rbd object {object:?} has {} sections",
                parts.len()
            )));
        };
        Ok(Some(Self {
            head: parse_hex(head, object)?,
            sequence: parse_hex(sequence, object)?,
        }))
    }
}

fn parse_hex(part: &str, object: &str) -> Result<u64> {
    u64::from_str_radix(part, 16)
        .map_err(|e| Error::invalid_argument(format!("rbd object {object:?}: {part:?}: {e}")))
}

/// Typed sub-operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubOp {
    Read { offset: u64, len: u64 },
    SparseRead { offset: u64, len: u64 },
    Stat,
    GetXattr { name: String },
    GetXattrs,
    CmpXattr { name: String, op: CmpOp, value: Bytes },
    CmpExt { offset: u64, data: Bytes },
    AssertExists,
    AssertVersion(u64),
    OmapGetKeys { start_after: String, max: u64 },
    OmapGetVals { start_after: String, filter_prefix: String, max: u64 },
    OmapGetValsByKeys { keys: Vec<String> },
    OmapCmp { key: String, op: CmpOp, value: Bytes },
    Checksum { kind: ChecksumType, init_value: u64, offset: u64, len: u64, chunk_size: u64 },
    Create { exclusive: bool },
    Write { offset: u64, data: Bytes },
    WriteFull { data: Bytes },
    WriteSame { offset: u64, write_len: u64, data: Bytes },
    Append { data: Bytes },
    Delete,
    Truncate { size: u64 },
    Zero { offset: u64, len: u64 },
    SetXattr { name: String, value: Bytes },
    RmXattr { name: String },
    OmapSetVals { entries: Vec<(String, Bytes)> },
    OmapRmKeys { keys: Vec<String> },
    OmapClear,
    SetAllocHint { object_size: u64, write_size: u64, flags: u32 },
}

impl SubOp {
    #[must_use]
    pub const fn code(&self) -> OpCode {
        match self {
            Self::Read { .. } => OpCode::Read,
            Self::SparseRead { .. } => OpCode::SparseRead,
            Self::Stat => OpCode::Stat,
            Self::GetXattr { .. } => OpCode::GetXattr,
            Self::GetXattrs => OpCode::GetXattrs,
            Self::CmpXattr { .. } => OpCode::CmpXattr,
            Self::CmpExt { .. } => OpCode::CmpExt,
            Self::AssertExists => OpCode::AssertExists,
            Self::AssertVersion(_) => OpCode::AssertVersion,
            Self::OmapGetKeys { .. } => OpCode::OmapGetKeys,
            Self::OmapGetVals { .. } => OpCode::OmapGetVals,
            Self::OmapGetValsByKeys { .. } => OpCode::OmapGetValsByKeys,
            Self::OmapCmp { .. } => OpCode::OmapCmp,
            Self::Checksum { .. } => OpCode::Checksum,
            Self::Create { .. } => OpCode::Create,
            Self::Write { .. } => OpCode::Write,
            Self::WriteFull { .. } => OpCode::WriteFull,
            Self::WriteSame { .. } => OpCode::WriteSame,
            Self::Append { .. } => OpCode::Append,
            Self::Delete => OpCode::Delete,
            Self::Truncate { .. } => OpCode::Truncate,
            Self::Zero { .. } => OpCode::Zero,
            Self::SetXattr { .. } => OpCode::SetXattr,
            Self::RmXattr { .. } => OpCode::RmXattr,
            Self::OmapSetVals { .. } => OpCode::OmapSetVals,
            Self::OmapRmKeys { .. } => OpCode::OmapRmKeys,
            Self::OmapClear => OpCode::OmapClear,
            Self::SetAllocHint { .. } => OpCode::SetAllocHint,
        }
    }

    #[must_use]
    pub const fn is_write(&self) -> bool {
        self.code().is_write()
    }
}

impl TryFrom<ClientOp> for SubOp {
    type Error = Error;

    fn try_from(op: ClientOp) -> Result<Self> {
        let ClientOp {
            code,
            offset,
            length,
            arg,
            aux,
            name,
            prefix,
            indata,
            keys,
            entries,
        } = op;
        let sub = match code {
            OpCode::Read => Self::Read { offset, len: length },
            OpCode::SparseRead => Self::SparseRead { offset, len: length },
            OpCode::Stat => Self::Stat,
            OpCode::GetXattr => Self::GetXattr { name },
            OpCode::GetXattrs => Self::GetXattrs,
            OpCode::CmpXattr => Self::CmpXattr {
                name,
                op: cmp_op(arg)?,
                value: indata.into(),
            },
            OpCode::CmpExt => Self::CmpExt {
                offset,
                data: indata.into(),
            },
            OpCode::AssertExists => Self::AssertExists,
            OpCode::AssertVersion => Self::AssertVersion(arg),
            OpCode::OmapGetKeys => Self::OmapGetKeys {
                start_after: name,
                max: length,
            },
            OpCode::OmapGetVals => Self::OmapGetVals {
                start_after: name,
                filter_prefix: prefix,
                max: length,
            },
            OpCode::OmapGetValsByKeys => Self::OmapGetValsByKeys { keys },
            OpCode::OmapCmp => Self::OmapCmp {
                key: name,
                op: cmp_op(arg)?,
                value: indata.into(),
            },
            OpCode::Checksum => Self::Checksum {
                kind: checksum_type(arg)?,
                init_value: checksum_seed(&indata)?,
                offset,
                len: length,
                chunk_size: aux,
            },
            OpCode::Create => Self::Create { exclusive: arg != 0 },
            OpCode::Write => Self::Write {
                offset,
                data: indata.into(),
            },
            OpCode::WriteFull => Self::WriteFull { data: indata.into() },
            OpCode::WriteSame => {
                if indata.is_empty() {
                    return Err(Error::invalid_argument("writesame with empty pattern"));
                }
                Self::WriteSame {
                    offset,
                    write_len: length,
                    data: indata.into(),
                }
            }
            OpCode::Append => Self::Append { data: indata.into() },
            OpCode::Delete => Self::Delete,
            OpCode::Truncate => Self::Truncate { size: offset },
            OpCode::Zero => Self::Zero { offset, len: length },
            OpCode::SetXattr => Self::SetXattr {
                name,
                value: indata.into(),
            },
            OpCode::RmXattr => Self::RmXattr { name },
            OpCode::OmapSetVals => Self::OmapSetVals {
                entries: entries.into_iter().map(|(k, v)| (k, v.into())).collect(),
            },
            OpCode::OmapRmKeys => Self::OmapRmKeys { keys },
            OpCode::OmapClear => Self::OmapClear,
            OpCode::SetAllocHint => Self::SetAllocHint {
                object_size: offset,
                write_size: length,
                flags: u32::try_from(arg)
                    .map_err(|_| Error::invalid_argument(format!("alloc hint flags {arg:#x}")))?,
            },
        };
        Ok(sub)
    }
}

fn cmp_op(arg: u64) -> Result<CmpOp> {
    let raw = u8::try_from(arg)
        .map_err(|_| Error::invalid_argument(format!("compare operator {arg}")))?;
    CmpOp::from_raw(raw)
}

fn checksum_type(arg: u64) -> Result<ChecksumType> {
    match arg {
        0 => Ok(ChecksumType::XxHash32),
        1 => Ok(ChecksumType::XxHash64),
        2 => Ok(ChecksumType::Crc32c),
        other => Err(Error::invalid_argument(format!("checksum type {other}"))),
    }
}

fn checksum_seed(indata: &[u8]) -> Result<u64> {
    if indata.is_empty() {
        return Ok(0);
    }
    let seed: [u8; 8] = indata
        .try_into()
        .map_err(|_| Error::invalid_argument(format!("checksum seed of {} bytes", indata.len())))?;
    Ok(u64::from_le_bytes(seed))
}

/// A normalised request, ready for the downstream handler
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpRequest {
    pub pool_id: PoolId,
    pub snap_id: SnapId,
    /// Client transaction id
    pub sequence: u64,
    pub pg_seed: u32,
    pub object: String,
    pub rbd: Option<RbdObjectId>,
    pub ops: Vec<SubOp>,
    pub access: Access,
}

impl OpRequest {
    /// Normalise `request`. Sub-op payloads are moved out of it, so on
    /// success `request.ops` is left empty.
    pub fn from_wire(request: &mut ClientRequest) -> Result<Self> {
        let rbd = RbdObjectId::parse(&request.object)?;
        let ops = std::mem::take(&mut request.ops)
            .into_iter()
            .map(SubOp::try_from)
            .collect::<Result<Vec<_>>>()?;
        // A single write sub-op makes the whole request a write.
        let access = if ops.iter().any(SubOp::is_write) {
            Access::Write
        } else {
            Access::Read
        };
        Ok(Self {
            pool_id: request.pool_id,
            snap_id: request.snap_id,
            sequence: request.tid,
            pg_seed: request.pg_seed,
            object: request.object.clone(),
            rbd,
            ops,
            access,
        })
    }

    #[must_use]
    pub fn is_write(&self) -> bool {
        self.access == Access::Write
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(object: &str, ops: Vec<ClientOp>) -> ClientRequest {
        ClientRequest {
            tid: 7,
            pool_id: 2,
            pg_seed: 11,
            snap_id: NOSNAP,
            object: object.to_string(),
            ops,
        }
    }

    #[test]
    fn test_rbd_object_id() {
        let id = RbdObjectId::parse("rbd_data.10226b8b4567.000000000000001f")
            .unwrap()
            .unwrap();
        assert_eq!(id.head, 0x1022_6b8b_4567);
        assert_eq!(id.sequence, 0x1f);

        let id = RbdObjectId::parse("rbd_data.3.abc.0000000000000002").unwrap().unwrap();
        assert_eq!(id.head, 0xabc);
        assert_eq!(id.sequence, 2);

        assert_eq!(RbdObjectId::parse("rbd_header.abc").unwrap(), None);
        assert_eq!(RbdObjectId::parse("plain-object").unwrap(), None);
        assert_eq!(RbdObjectId::parse("").unwrap(), None);
    }

    #[test]
    fn test_short_rbd_name_is_invalid() {
        for name in ["rbd_data", "rbd_data.abc", "rbd_data..abc"] {
            let err = RbdObjectId::parse(name).unwrap_err();
            assert_eq!(err.errno(), -libc::EINVAL, "{name}");
        }
        assert!(RbdObjectId::parse("rbd_data.xyz.1").is_err());
    }

    #[test]
    fn test_mixed_request_is_write() {
        let mut req = request(
            "obj",
            vec![
                ClientOp::read(0, 10),
                ClientOp::write(0, b"x".to_vec()),
                ClientOp::stat(),
            ],
        );
        let op = OpRequest::from_wire(&mut req).unwrap();
        assert_eq!(op.access, Access::Write);
        assert_eq!(op.ops.len(), 3);
        assert!(req.ops.is_empty());
        assert_eq!(op.sequence, 7);
        assert_eq!(op.rbd, None);
    }

    #[test]
    fn test_read_only_request() {
        let mut req = request(
            "rbd_data.ab.0000000000000010",
            vec![ClientOp::read(0, 4096), ClientOp::new(OpCode::GetXattrs)],
        );
        let op = OpRequest::from_wire(&mut req).unwrap();
        assert_eq!(op.access, Access::Read);
        assert_eq!(op.rbd, Some(RbdObjectId { head: 0xab, sequence: 0x10 }));
        assert_eq!(op.ops[0], SubOp::Read { offset: 0, len: 4096 });
    }

    #[test]
    fn test_sub_op_decoding() {
        let sub = SubOp::try_from(
            ClientOp::new(OpCode::CmpXattr).name("ver").arg(1).data(b"2".to_vec()),
        )
        .unwrap();
        assert_eq!(
            sub,
            SubOp::CmpXattr {
                name: "ver".into(),
                op: CmpOp::Eq,
                value: Bytes::from_static(b"2"),
            }
        );

        let sub = SubOp::try_from(
            ClientOp::new(OpCode::Checksum)
                .extent(0, 8)
                .arg(2)
                .aux(4)
                .data(5u64.to_le_bytes().to_vec()),
        )
        .unwrap();
        assert_eq!(
            sub,
            SubOp::Checksum {
                kind: ChecksumType::Crc32c,
                init_value: 5,
                offset: 0,
                len: 8,
                chunk_size: 4,
            }
        );

        let sub = SubOp::try_from(ClientOp::new(OpCode::Truncate).extent(100, 0)).unwrap();
        assert_eq!(sub, SubOp::Truncate { size: 100 });
        assert!(sub.is_write());
    }

    #[test]
    fn test_bad_arguments_rejected() {
        assert!(SubOp::try_from(ClientOp::new(OpCode::CmpXattr).arg(9)).is_err());
        assert!(SubOp::try_from(ClientOp::new(OpCode::OmapCmp).arg(300)).is_err());
        assert!(SubOp::try_from(ClientOp::new(OpCode::Checksum).arg(3)).is_err());
        assert!(SubOp::try_from(ClientOp::new(OpCode::Checksum).data(vec![1, 2])).is_err());
        assert!(SubOp::try_from(ClientOp::new(OpCode::WriteSame).extent(0, 8)).is_err());

        let mut req = request("obj", vec![ClientOp::stat(), ClientOp::new(OpCode::OmapCmp)]);
        let err = OpRequest::from_wire(&mut req).unwrap_err();
        assert_eq!(err.errno(), -libc::EINVAL);
    }
}
