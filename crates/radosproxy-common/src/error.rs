//! Error types for RadosProxy
//!
//! Every layer propagates this error with `?`. At the public boundary an
//! error collapses into a negative errno-style status code, the same
//! convention the cluster client uses for its own return values.

use crate::types::{PoolEvent, PoolId};
use thiserror::Error;

/// Common result type for RadosProxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for RadosProxy
#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    // Connection errors
    #[error("connect to cluster failed after {attempts} attempts: errno {code}")]
    ConnectFailed { attempts: u32, code: i32 },

    #[error("cluster client is not connected")]
    NotConnected,

    #[error("proxy is shutting down")]
    Shutdown,

    // Lookup errors
    #[error("pool not found: {0}")]
    PoolNotFound(String),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("pool usage not recorded for pool {0}")]
    UsageNotFound(PoolId),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    // Request errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("comparison failed at sub-op {index}")]
    CompareMismatch { index: usize, code: i32 },

    // Allocation errors
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    // Parse errors
    #[error("parse error: {0}")]
    Parse(String),

    // Registration errors
    #[error("{0} observer already registered")]
    AlreadyRegistered(PoolEvent),

    #[error("pool {event} notification failed for pools {failed:?}")]
    PoolNotify { event: PoolEvent, failed: Vec<PoolId> },

    // Raw cluster client errors
    #[error("cluster error during {op}: errno {code}")]
    Cluster { op: String, code: i32 },

    // Internal errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Wrap a raw cluster client return code
    pub fn cluster(op: impl Into<String>, code: i32) -> Self {
        Self::Cluster {
            op: op.into(),
            code,
        }
    }

    /// Convert a negative cluster client return code into the closest error
    /// variant. Positive codes are treated as their negated form.
    pub fn from_errno(code: i32, context: impl Into<String>) -> Self {
        let context = context.into();
        let code = if code > 0 { -code } else { code };
        match code {
            c if c == -libc::ENOENT => Self::NotFound(context),
            c if c == -libc::EEXIST => Self::AlreadyExists(context),
            c if c == -libc::EINVAL => Self::InvalidArgument(context),
            c if c == -libc::ENOMEM => Self::OutOfMemory(context),
            c if c == -libc::ESHUTDOWN => Self::Shutdown,
            c if c == -libc::ENOTCONN => Self::NotConnected,
            c if c == -libc::EOPNOTSUPP => Self::NotSupported(context),
            c => Self::Cluster { op: context, code: c },
        }
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotConnected => true,
            Self::Cluster { code, .. } => {
                *code == -libc::EAGAIN || *code == -libc::ETIMEDOUT || *code == -libc::EBUSY
            }
            _ => false,
        }
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::PoolNotFound(_)
                | Self::ImageNotFound(_)
                | Self::SnapshotNotFound(_)
                | Self::ObjectNotFound(_)
                | Self::UsageNotFound(_)
                | Self::NotFound(_)
        )
    }

    /// Negative errno status for this error
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::Configuration(_)
            | Self::InvalidArgument(_)
            | Self::Parse(_)
            | Self::Serialization(_) => -libc::EINVAL,
            Self::ConnectFailed { code, .. } => {
                if *code < 0 {
                    *code
                } else {
                    -libc::ENOTCONN
                }
            }
            Self::NotConnected => -libc::ENOTCONN,
            Self::Shutdown => -libc::ESHUTDOWN,
            Self::PoolNotFound(_)
            | Self::ImageNotFound(_)
            | Self::SnapshotNotFound(_)
            | Self::ObjectNotFound(_)
            | Self::UsageNotFound(_)
            | Self::NotFound(_) => -libc::ENOENT,
            Self::AlreadyExists(_) | Self::AlreadyRegistered(_) => -libc::EEXIST,
            Self::NotSupported(_) => -libc::EOPNOTSUPP,
            Self::CompareMismatch { code, .. } => *code,
            Self::OutOfMemory(_) => -libc::ENOMEM,
            Self::PoolNotify { .. } | Self::Internal(_) => -libc::EIO,
            Self::Cluster { code, .. } => *code,
            Self::Io(e) => e.raw_os_error().map_or(-libc::EIO, |c| -c),
        }
    }
}

/// Collapse a result into the public status code convention (0 on success).
pub fn status_of<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.errno(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::PoolNotFound("rbd".into()).errno(), -libc::ENOENT);
        assert_eq!(Error::invalid_argument("x").errno(), -libc::EINVAL);
        assert_eq!(Error::AlreadyRegistered(PoolEvent::Created).errno(), -libc::EEXIST);
        assert_eq!(Error::cluster("mon_command", -libc::ETIMEDOUT).errno(), -libc::ETIMEDOUT);
        assert_eq!(
            Error::ConnectFailed { attempts: 5, code: -libc::ECONNREFUSED }.errno(),
            -libc::ECONNREFUSED
        );
    }

    #[test]
    fn test_from_errno_round_trips_known_codes() {
        assert!(Error::from_errno(-libc::ENOENT, "pool 7").is_not_found());
        assert!(Error::from_errno(libc::ENOENT, "pool 7").is_not_found());
        assert!(matches!(
            Error::from_errno(-libc::EEXIST, "snap"),
            Error::AlreadyExists(_)
        ));
        let raw = Error::from_errno(-libc::EROFS, "write");
        assert_eq!(raw.errno(), -libc::EROFS);
    }

    #[test]
    fn test_status_of() {
        let ok: Result<u32> = Ok(3);
        assert_eq!(status_of(&ok), 0);
        let err: Result<u32> = Err(Error::Shutdown);
        assert_eq!(status_of(&err), -libc::ESHUTDOWN);
    }

    #[test]
    fn test_retryable() {
        assert!(Error::NotConnected.is_retryable());
        assert!(Error::cluster("op", -libc::EAGAIN).is_retryable());
        assert!(!Error::PoolNotFound("p".into()).is_retryable());
    }
}
