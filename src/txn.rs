use crate::key::ValueKind;
use crate::storage::StorageManager;
use crate::wal::Entry;
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

type ReadGuard = ArcRwLockReadGuard<RawRwLock, ()>;
type WriteGuard = ArcRwLockWriteGuard<RawRwLock, ()>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TxnMode {
    ReadOnly,
    ReadWrite,
}

enum IsolationGuard {
    Read(ReadGuard),
    Write(WriteGuard),
}

#[derive(Default)]
struct TxnCounters {
    started: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TxnStats {
    pub started: u64,
    pub committed: u64,
    pub aborted: u64,
    pub active: u64,
}

/// Hands out transactions over the storage manager.
///
/// Isolation comes from a single process-wide reader/writer lock: readers
/// share it, a writer owns it exclusively for the transaction's whole
/// lifetime. Writers therefore serialize, and their buffered writes are
/// invisible until commit applies them as one batch.
pub struct TxnManager {
    storage: Arc<StorageManager>,
    isolation: Arc<RwLock<()>>,
    counters: Arc<TxnCounters>,
}

impl TxnManager {
    pub fn new(storage: Arc<StorageManager>) -> TxnManager {
        TxnManager {
            storage,
            isolation: Arc::new(RwLock::new(())),
            counters: Arc::new(TxnCounters::default()),
        }
    }

    /// Begins a transaction, blocking until the isolation lock is granted.
    pub fn begin(&self, read_only: bool) -> Txn {
        self.counters.started.fetch_add(1, Ordering::SeqCst);
        let (mode, guard) = if read_only {
            (TxnMode::ReadOnly, IsolationGuard::Read(self.isolation.read_arc()))
        } else {
            (
                TxnMode::ReadWrite,
                IsolationGuard::Write(self.isolation.write_arc()),
            )
        };
        Txn {
            storage: self.storage.clone(),
            counters: self.counters.clone(),
            mode,
            buffer: BTreeMap::new(),
            guard: Some(guard),
            last_active: Instant::now(),
        }
    }

    pub fn stats(&self) -> TxnStats {
        let started = self.counters.started.load(Ordering::SeqCst);
        let committed = self.counters.committed.load(Ordering::SeqCst);
        let aborted = self.counters.aborted.load(Ordering::SeqCst);
        TxnStats {
            started,
            committed,
            aborted,
            active: started - committed - aborted,
        }
    }

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }
}

/// One open transaction.
///
/// Writes accumulate in a private buffer; reads consult the buffer first
/// and fall through to the storage manager. Commit applies the buffer as a
/// single WAL batch, so every mutation shares one sequence number and lands
/// atomically. Rollback (explicit, by drop, or forced by an outer registry
/// timing the transaction out) discards the buffer; it is idempotent.
pub struct Txn {
    storage: Arc<StorageManager>,
    counters: Arc<TxnCounters>,
    mode: TxnMode,
    buffer: BTreeMap<Bytes, Option<Bytes>>,
    guard: Option<IsolationGuard>,
    last_active: Instant,
}

impl Txn {
    pub fn mode(&self) -> TxnMode {
        self.mode
    }

    pub fn is_read_only(&self) -> bool {
        self.mode == TxnMode::ReadOnly
    }

    pub fn is_active(&self) -> bool {
        self.guard.is_some()
    }

    /// Instant of the most recent operation; an outer registry uses this to
    /// expire idle transactions.
    pub fn last_active_time(&self) -> Instant {
        self.last_active
    }

    fn touch(&mut self) -> Result<()> {
        if self.guard.is_none() {
            return Err(Error::TxnClosed);
        }
        self.last_active = Instant::now();
        Ok(())
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Bytes> {
        self.touch()?;
        match self.buffer.get(key) {
            Some(Some(v)) => Ok(v.clone()),
            Some(None) => Err(Error::KeyNotFound),
            None => self.storage.get(key),
        }
    }

    pub fn put(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        self.touch()?;
        if self.is_read_only() {
            return Err(Error::TxnReadOnly);
        }
        self.buffer.insert(key.into(), Some(value.into()));
        Ok(())
    }

    pub fn delete(&mut self, key: impl Into<Bytes>) -> Result<()> {
        self.touch()?;
        if self.is_read_only() {
            return Err(Error::TxnReadOnly);
        }
        self.buffer.insert(key.into(), None);
        Ok(())
    }

    /// Ordered scan over `[start, end)` with this transaction's buffered
    /// writes overlaid on the storage view.
    pub fn scan(&mut self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<Vec<(Bytes, Bytes)>> {
        self.touch()?;
        let mut merged: BTreeMap<Bytes, Bytes> = self
            .storage
            .scan(start, end)?
            .into_iter()
            .collect();
        for (key, value) in &self.buffer {
            if let Some(start) = start {
                if key.as_ref() < start {
                    continue;
                }
            }
            if let Some(end) = end {
                if key.as_ref() >= end {
                    continue;
                }
            }
            match value {
                Some(v) => {
                    merged.insert(key.clone(), v.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    /// Applies the write buffer as one atomic batch and releases isolation.
    /// A read-only transaction, or one with nothing buffered, commits as a
    /// pure lock release.
    pub fn commit(&mut self) -> Result<()> {
        if self.guard.is_none() {
            return Err(Error::TxnClosed);
        }
        if !self.buffer.is_empty() {
            let entries: Vec<Entry> = self
                .buffer
                .iter()
                .map(|(key, value)| match value {
                    Some(v) => Entry {
                        seq: 0,
                        kind: ValueKind::Put,
                        key: key.clone(),
                        value: v.clone(),
                    },
                    None => Entry {
                        seq: 0,
                        kind: ValueKind::Delete,
                        key: key.clone(),
                        value: Bytes::new(),
                    },
                })
                .collect();
            match self.storage.apply_batch(&entries) {
                Ok(_) => {}
                Err(e) => {
                    // A failed apply aborts the transaction; isolation is
                    // released either way.
                    self.buffer.clear();
                    self.guard = None;
                    self.counters.aborted.fetch_add(1, Ordering::SeqCst);
                    return Err(e);
                }
            }
            self.buffer.clear();
        }
        self.guard = None;
        self.counters.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Discards buffered writes and releases isolation. Safe to call any
    /// number of times.
    pub fn rollback(&mut self) -> Result<()> {
        if self.guard.is_none() {
            return Ok(());
        }
        self.buffer.clear();
        self.guard = None;
        self.counters.aborted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        let _ = self.rollback();
    }
}
