//! Error types for the store.

use crate::types::Pgno;
use thiserror::Error;

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the store
#[derive(Error, Debug)]
pub enum StoreError {
    /// I/O error from the underlying file system
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Key (or key+value for a DUPSORT tree) is absent
    #[error("key not found")]
    KeyNotFound,

    /// NoOverwrite / NoDupData refused to replace an existing entry
    #[error("key already exists")]
    KeyExists,

    /// File growth reached the geometry's upper bound
    #[error("database map is full")]
    MapFull,

    /// The host refused to extend the mapping
    #[error("unable to extend the database map")]
    UnableExtendMapsize,

    /// Dirty-page accounting for this transaction is exhausted
    #[error("transaction has too many dirty pages")]
    TxnFull,

    /// A node did not fit its page; callers retry as a split, so an
    /// escaped PageFull means a corrupted page
    #[error("page {pgno} is full, need {needed} bytes but only {available} available")]
    PageFull {
        pgno: Pgno,
        needed: usize,
        available: usize,
    },

    /// Tree depth exceeded the cursor stack bound
    #[error("cursor stack depth exceeded")]
    CursorFull,

    /// Key or value exceeds the size limits for this tree
    #[error("bad {what} size: {size} bytes (max {max})")]
    BadValSize {
        what: &'static str,
        size: usize,
        max: usize,
    },

    /// Unknown or stale tree handle
    #[error("bad DBI handle")]
    BadDbi,

    /// Operation on a finished or wrong-kind transaction
    #[error("bad transaction")]
    BadTxn,

    /// Reader slot does not belong to this transaction anymore
    #[error("bad reader slot")]
    BadReaderSlot,

    /// DBI flags disagree with the on-disk tree, or the operation does not
    /// apply to this kind of tree
    #[error("incompatible operation: {0}")]
    Incompatible(&'static str),

    /// Another writer holds the lock and the caller asked not to wait
    #[error("environment is busy with another writer")]
    Busy,

    /// Structural damage; the environment refuses further operations
    #[error("corrupted: {0}")]
    Corrupted(String),

    /// A tree references a page beyond the allocated file
    #[error("page {0} not found")]
    PageNotFound(Pgno),

    /// The file carries an unsupported format version
    #[error("format version mismatch")]
    VersionMismatch,

    /// The file is not a database, or a handle is not usable
    #[error("invalid: {0}")]
    Invalid(&'static str),

    /// The database needs a writer to finish an interrupted meta rotation
    /// but was opened read-only
    #[error("database requires recovery but is opened read-only")]
    WannaRecovery,

    /// Active readers prevent the operation
    #[error("readers are still active")]
    BusyReaders,

    /// The reader slot table is exhausted
    #[error("reader slot table is full")]
    ReadersFull,

    /// This reader's slot was evicted by the slow-reader policy
    #[error("reader was ousted by the writer")]
    Ousted,
}

impl StoreError {
    /// Create a corruption error with a message
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::Corrupted(msg.into())
    }

    /// Key-size violation
    pub fn bad_key_size(size: usize, max: usize) -> Self {
        Self::BadValSize {
            what: "key",
            size,
            max,
        }
    }

    /// Value-size violation
    pub fn bad_val_size(size: usize, max: usize) -> Self {
        Self::BadValSize {
            what: "value",
            size,
            max,
        }
    }
}
