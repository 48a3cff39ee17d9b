//! Error types for stripeio
//!
//! Errors carry the classification the wire protocol needs: every error
//! maps to a negative integer return code for replies, and the fatal /
//! retryable split drives daemon behaviour (a device error aborts the OSD,
//! a full journal re-queues the operation).

use crate::types::{ObjVer, Oid, OsdNum};
use thiserror::Error;

/// Common result type for stripeio operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for stripeio
#[derive(Debug, Error)]
pub enum Error {
    /// Bad magic, unknown opcode, misaligned I/O, length cap exceeded.
    /// Surfaced to the client; the connection is kept.
    #[error("invalid request: {0}")]
    InvalidInput(String),

    /// Write to a version not greater than the current max for the object.
    #[error("version conflict on {oid}: supplied {supplied}, current {current}")]
    VersionConflict { oid: Oid, supplied: u64, current: u64 },

    /// Stabilize of a version that is not yet synced. The caller must sync
    /// and retry.
    #[error("{0} is not synced yet, sync first")]
    SyncRequired(ObjVer),

    /// Journal cannot fit the operation without eating into the stabilize
    /// reservation. The operation is re-queued and retried.
    #[error("journal space exhausted")]
    JournalFull,

    /// No free blocks left on the data device.
    #[error("data device is full")]
    DiskFull,

    #[error("object not found: {0}")]
    ObjectNotFound(Oid),

    /// A peer OSD did not answer in time or the connection dropped.
    /// A primary operation failing this way triggers re-peering of the PG.
    #[error("peer OSD {0} unreachable")]
    PeerUnreachable(OsdNum),

    #[error("request timeout")]
    Timeout,

    /// I/O error on the data, journal or metadata device. Fatal: in-memory
    /// and on-disk state may have diverged.
    #[error("device I/O error on {path}: {source}")]
    DeviceIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// On-disk structure failed validation (magic, checksum, CRC chain).
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// Cluster configuration store failure; retried with backoff.
    #[error("cluster store error: {0}")]
    ClusterStore(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn device_io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::DeviceIo {
            path: path.into(),
            source,
        }
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the condition is transient and the caller should retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::JournalFull | Self::SyncRequired(_) | Self::Timeout | Self::ClusterStore(_)
        )
    }

    /// Whether the daemon must abort: continuing would serve state that no
    /// longer matches the disk.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceIo { .. } | Self::Corruption(_))
    }

    /// Negative integer return code used in wire replies.
    #[must_use]
    pub fn to_retval(&self) -> i64 {
        match self {
            Self::InvalidInput(_) | Self::VersionConflict { .. } | Self::Configuration(_) => -22, // EINVAL
            Self::SyncRequired(_) => -11,                              // EAGAIN
            Self::JournalFull | Self::DiskFull => -28,                 // ENOSPC
            Self::ObjectNotFound(_) => -2,                             // ENOENT
            Self::PeerUnreachable(_) | Self::Timeout => -32,           // EPIPE
            Self::DeviceIo { .. } | Self::Corruption(_) => -5,         // EIO
            Self::ClusterStore(_) | Self::Internal(_) => -103,         // ECONNABORTED
        }
    }

    /// Reconstruct an error class from a wire retval. Used when a reply
    /// from a peer must be turned back into a local error.
    #[must_use]
    pub fn from_retval(retval: i64, peer: OsdNum) -> Self {
        match retval {
            -22 => Self::InvalidInput("peer rejected request".into()),
            -11 => Self::SyncRequired(ObjVer::new(Oid::new(0, 0), 0)),
            -28 => Self::JournalFull,
            -2 => Self::ObjectNotFound(Oid::new(0, 0)),
            -32 => Self::PeerUnreachable(peer),
            -5 => Self::Internal(format!("peer {peer} reported a device error")),
            other => Self::Internal(format!("peer {peer} returned {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::JournalFull.is_retryable());
        assert!(!Error::JournalFull.is_fatal());
        assert!(Error::device_io("/dev/sda", std::io::Error::other("boom")).is_fatal());
        assert!(!Error::InvalidInput("x".into()).is_retryable());
    }

    #[test]
    fn test_retval_mapping() {
        assert_eq!(Error::JournalFull.to_retval(), -28);
        assert_eq!(
            Error::SyncRequired(ObjVer::new(Oid::new(1, 0), 2)).to_retval(),
            -11
        );
        assert_eq!(Error::PeerUnreachable(3).to_retval(), -32);
        assert!(matches!(
            Error::from_retval(-32, 3),
            Error::PeerUnreachable(3)
        ));
    }
}
