use thiserror::Error;

use crate::clock::Timestamp;
use crate::schema::SchemaId;

#[derive(Error, Debug)]
pub enum Error {
    /// The buffer pool has no free page left, even after an opportunistic
    /// GC pass. Promotion is skipped; the log remains authoritative.
    #[error("no free page in the buffer pool")]
    NoSpace,

    /// The value pointer's timestamp moved past the expected one while a
    /// promotion was in flight. The caller should re-resolve through the
    /// index.
    #[error("timestamp conflict: value pointer no longer at {expected}")]
    Conflict { expected: Timestamp },

    /// A cached row's timestamp diverged from the value pointer during a
    /// read. The fast path is dropped; the caller falls back to the log.
    #[error("stale row: expected timestamp {expected}, found {found}")]
    Stale {
        expected: Timestamp,
        found: Timestamp,
    },

    #[error("value size mismatch: got {got} bytes, schema expects {want}")]
    SizeMismatch { got: usize, want: usize },

    /// Drop/evict target is absent, or a key lookup came up empty.
    #[error("not found")]
    NotFound,

    #[error("unknown schema id {0}")]
    SchemaUnknown(SchemaId),

    /// A record that can never fit: a log record above the chunk size, or
    /// a row wider than a single page.
    #[error("record of {size} bytes exceeds limit of {max}")]
    RecordTooLarge { size: usize, max: usize },

    #[error("value log capacity exhausted")]
    LogFull,

    /// Checksum mismatch or impossible record framing in the value log.
    #[error("log corruption at address {addr:#x}: {detail}")]
    Corruption { addr: u64, detail: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
