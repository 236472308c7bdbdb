//! Embedded, single-node, ordered key/value storage engine.
//!
//! Writes go to a write-ahead log first, then into an in-memory ordered
//! multi-version map (the memtable). Full memtables are frozen and spilled
//! into immutable sorted runs on disk (SSTables), which are consulted
//! newest-first on reads. A process-wide reader/writer lock provides
//! transaction isolation on top of the storage manager.

use std::io;

pub mod filename;
pub mod filter;
pub mod iterator;
pub mod key;
pub mod memtable;
pub mod opts;
pub mod sstable;
pub mod storage;
pub mod txn;
pub mod wal;

pub use key::{InternalKey, Record, ValueKind};
pub use memtable::MemTable;
pub use opts::{default_opts, Opts, OptsRaw, SyncMode};
pub use storage::StorageManager;
pub use txn::{Txn, TxnManager, TxnMode};
pub use wal::{Batch, Entry, Wal, WalObserver};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key not found")]
    KeyNotFound,

    #[error("WAL is closed")]
    WalClosed,

    #[error("WAL is rotating")]
    WalRotating,

    #[error("WAL file is full")]
    WalFull,

    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    #[error("invalid record type: {0}")]
    InvalidRecordType(u8),

    #[error("invalid operation type: {0}")]
    InvalidOpType(u8),

    #[error("sequence number overflow")]
    SequenceOverflow,

    #[error("empty batch")]
    EmptyBatch,

    #[error("batch too large: {size} bytes exceeds {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("invalid table file: {0}")]
    InvalidTable(String),

    #[error("recovery failed: {0}")]
    Recovery(String),

    #[error("transaction is no longer active")]
    TxnClosed,

    #[error("transaction is read-only")]
    TxnReadOnly,

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
