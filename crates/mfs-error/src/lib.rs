#![forbid(unsafe_code)]
//! Error types for the MarlinFS MDS.
//!
//! Defines `MdsError` and a `Result<T>` alias used throughout the workspace.
//! The journaling core treats every variant except the codec errors as a
//! logic violation: the server aborts rather than run on possibly-corrupt
//! metadata.

use thiserror::Error;

/// Unified error type for MDS journaling operations.
#[derive(Debug, Error)]
pub enum MdsError {
    #[error("malformed journal entry: {0}")]
    Codec(String),

    #[error("unknown journal event type code {0:#x}")]
    UnknownEventKind(u32),

    #[error("journal entry checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    Checksum { expected: u32, actual: u32 },

    #[error("{kind} entries are trimmed immediately and never drive expiration")]
    IllegalExpire { kind: &'static str },

    #[error("log is capped but open-file records still hold client caps")]
    CappedOpens,

    #[error("expire for export of {0} that is not cached or not in progress")]
    ExportNotActive(String),

    #[error("replay out of order: event produces {table} version {event}, table is at {found}")]
    ReplayOrder {
        table: &'static str,
        event: u64,
        found: u64,
    },

    #[error("replayed allocation yielded id {got}, journal recorded {want}")]
    AllocMismatch { want: u64, got: u64 },

    #[error("no cached inode {0:#x} while rebuilding a directory fragment")]
    MissingInode(u64),

    #[error("duplicate prepare for request {0}")]
    DuplicatePrepare(String),
}

/// Result alias using `MdsError`.
pub type Result<T> = std::result::Result<T, MdsError>;
