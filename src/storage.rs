use crate::filename::{self, FileType};
use crate::iterator::{MemTableScanner, MergeScanner, RecordScanner, SSTableScanner};
use crate::key::ValueKind;
use crate::memtable::{recover_from_wal, MemTable, RecoveryOptions, RecoveryStats};
use crate::opts::Opts;
use crate::sstable::{SSTableReader, SSTableWriter};
use crate::wal::{Entry, Wal};
use crate::{Error, Result};
use bytes::Bytes;
use crossbeam::channel::{unbounded, Receiver, Sender};
use file_lock::{FileLock, FileOptions};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

enum CleanupTask {
    /// Delete WAL segments whose name sorts before `keep_from`.
    SweepWal { keep_from: OsString },
    Shutdown,
}

struct FrozenMemTable {
    mem: Arc<MemTable>,
    /// Name of the oldest WAL segment still covering this table's entries.
    wal_floor: OsString,
}

struct EngineState {
    mutable: Arc<MemTable>,
    mutable_floor: OsString,
    /// Oldest first.
    frozen: Vec<FrozenMemTable>,
    /// Newest first.
    sstables: Vec<Arc<SSTableReader>>,
}

impl EngineState {
    fn wal_floor(&self) -> OsString {
        let mut floor = self.mutable_floor.clone();
        for f in &self.frozen {
            if f.wal_floor < floor {
                floor = f.wal_floor.clone();
            }
        }
        floor
    }
}

/// Coordinates the WAL, the memtable pool, and the SSTable set.
///
/// Writes append to the WAL first and are then applied to the mutable
/// memtable. When the memtable or the current segment reaches its size
/// limit, the segment is rotated: the old WAL is closed, the memtable is
/// frozen into the pool, and a fresh pair takes over. `flush_memtables`
/// spills frozen tables to SSTables and retires the covering segments.
pub struct StorageManager {
    opts: Opts,
    wal: Mutex<Arc<Wal>>,
    state: RwLock<EngineState>,
    rotation_lock: Mutex<()>,
    rotating: AtomicBool,
    closed: AtomicBool,
    next_sst_id: AtomicU64,
    recovery_stats: RecoveryStats,
    cleanup_tx: Sender<CleanupTask>,
    cleanup_thread: Mutex<Option<JoinHandle<()>>>,
    _dir_lock: FileLock,
}

impl StorageManager {
    pub fn open(opts: Opts) -> Result<StorageManager> {
        std::fs::create_dir_all(&opts.wal_dir)?;
        std::fs::create_dir_all(&opts.sst_dir)?;

        let lock_path = filename::lock_filename(&opts.sst_dir);
        let lock_str = lock_path
            .to_str()
            .ok_or_else(|| Error::InvalidTable("data directory is not valid UTF-8".into()))?;
        let dir_lock = FileLock::lock(
            lock_str,
            false,
            FileOptions::new().read(true).write(true).create(true),
        )?;

        // Existing tables, newest first. An unreadable table is skipped
        // rather than wedging startup.
        let mut sstables = Vec::new();
        let mut max_table_id = 0u64;
        for path in filename::sorted_table_files(&opts.sst_dir)?.into_iter().rev() {
            if let Some(FileType::Table(id)) = filename::parse_filename(&path) {
                max_table_id = max_table_id.max(id);
            }
            match SSTableReader::open(&path) {
                Ok(r) => sstables.push(Arc::new(r)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable table")
                }
            }
        }

        let existing_segments = filename::sorted_wal_files(&opts.wal_dir)?;
        let (mut tables, max_seq, recovery_stats) =
            recover_from_wal(&opts, &RecoveryOptions::from_opts(&opts))?;

        let wal = match Wal::reuse(opts.clone(), &opts.wal_dir, max_seq + 1)? {
            Some(w) => w,
            None => {
                let w = Wal::create(opts.clone(), &opts.wal_dir)?;
                w.update_next_sequence(max_seq + 1);
                w
            }
        };
        let wal = Arc::new(wal);

        let current_name = wal
            .path()
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        // Recovered tables may span every existing segment, so their floor
        // is the oldest one on disk.
        let floor = existing_segments
            .first()
            .and_then(|p| p.file_name().map(|n| n.to_os_string()))
            .unwrap_or_else(|| current_name.clone());

        let mutable = tables.pop().expect("recovery returns at least one table");
        let frozen = tables
            .into_iter()
            .map(|mem| FrozenMemTable {
                mem,
                wal_floor: floor.clone(),
            })
            .collect();

        let (cleanup_tx, cleanup_rx) = unbounded();
        let wal_dir = opts.wal_dir.clone();
        let cleanup_thread = std::thread::spawn(move || run_cleanup(wal_dir, cleanup_rx));

        info!(
            tables = sstables.len(),
            next_seq = max_seq + 1,
            "storage manager open"
        );
        Ok(StorageManager {
            opts,
            wal: Mutex::new(wal),
            state: RwLock::new(EngineState {
                mutable,
                mutable_floor: floor,
                frozen,
                sstables,
            }),
            rotation_lock: Mutex::new(()),
            rotating: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            next_sst_id: AtomicU64::new(max_table_id + 1),
            recovery_stats,
            cleanup_tx,
            cleanup_thread: Mutex::new(Some(cleanup_thread)),
            _dir_lock: dir_lock,
        })
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<u64> {
        self.write_entry(ValueKind::Put, key, value)
    }

    pub fn delete(&self, key: &[u8]) -> Result<u64> {
        self.write_entry(ValueKind::Delete, key, b"")
    }

    fn write_entry(&self, kind: ValueKind, key: &[u8], value: &[u8]) -> Result<u64> {
        // Merge is reserved in the WAL framing but has no apply path here;
        // reject it before anything reaches the log.
        if kind == ValueKind::Merge {
            return Err(Error::InvalidOpType(kind as u8));
        }
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::WalClosed);
            }
            let attempt = {
                let state = self.state.read();
                let wal = self.wal.lock().clone();
                match wal.append(kind, key, value) {
                    Ok(seq) => {
                        match kind {
                            ValueKind::Put => state.mutable.put(key, value, seq),
                            ValueKind::Delete => state.mutable.delete(key, seq),
                            ValueKind::Merge => {}
                        }
                        let rotate = state.mutable.approximate_size() >= self.opts.memtable_size
                            || wal.size() >= self.opts.wal_max_size;
                        Ok((seq, rotate))
                    }
                    Err(e) => Err(e),
                }
            };
            match attempt {
                Ok((seq, rotate)) => {
                    if rotate {
                        self.maybe_rotate()?;
                    }
                    return Ok(seq);
                }
                // A rotation is swapping segments under us; retry against
                // the fresh pointer.
                Err(Error::WalRotating) => std::thread::yield_now(),
                Err(e) => return Err(e),
            }
        }
    }

    /// Applies a committed write set as one WAL batch; every entry lands
    /// under the same sequence number. Duplicate keys resolve last-wins.
    /// Merge entries are rejected up front: nothing is logged and no
    /// sequence number is consumed for a batch carrying one.
    pub fn apply_batch(&self, entries: &[Entry]) -> Result<u64> {
        if entries.is_empty() {
            return Err(Error::EmptyBatch);
        }
        if let Some(e) = entries.iter().find(|e| e.kind == ValueKind::Merge) {
            return Err(Error::InvalidOpType(e.kind as u8));
        }
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::WalClosed);
            }
            let attempt = {
                let state = self.state.read();
                let wal = self.wal.lock().clone();
                match wal.append_batch(entries) {
                    Ok(seq) => {
                        for e in entries {
                            match e.kind {
                                ValueKind::Put => state.mutable.put(&e.key, &e.value, seq),
                                ValueKind::Delete => state.mutable.delete(&e.key, seq),
                                ValueKind::Merge => {}
                            }
                        }
                        let rotate = state.mutable.approximate_size() >= self.opts.memtable_size
                            || wal.size() >= self.opts.wal_max_size;
                        Ok((seq, rotate))
                    }
                    Err(e) => Err(e),
                }
            };
            match attempt {
                Ok((seq, rotate)) => {
                    if rotate {
                        self.maybe_rotate()?;
                    }
                    return Ok(seq);
                }
                Err(Error::WalRotating) => std::thread::yield_now(),
                Err(e) => return Err(e),
            }
        }
    }

    /// Newest-first lookup: mutable memtable, then frozen tables, then
    /// SSTables. The first hit wins; a tombstone hit reports the key as
    /// absent without consulting older levels.
    pub fn get(&self, key: &[u8]) -> Result<Bytes> {
        let state = self.state.read();
        match state.mutable.get(key) {
            Some(Some(v)) => return Ok(v),
            Some(None) => return Err(Error::KeyNotFound),
            None => {}
        }
        for f in state.frozen.iter().rev() {
            match f.mem.get(key) {
                Some(Some(v)) => return Ok(v),
                Some(None) => return Err(Error::KeyNotFound),
                None => {}
            }
        }
        for sst in &state.sstables {
            match sst.get(key) {
                Ok(Some((ValueKind::Delete, _))) => return Err(Error::KeyNotFound),
                Ok(Some((_, v))) => return Ok(v),
                Ok(None) => continue,
                Err(Error::InvalidTable(msg)) | Err(Error::CorruptRecord(msg)) => {
                    warn!(path = %sst.path().display(), %msg, "corrupt table during read, skipping");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::KeyNotFound)
    }

    /// Ordered scan over `[start, end)`, merged across every level with the
    /// newest version of each key winning and tombstoned keys suppressed.
    pub fn scan(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<Vec<(Bytes, Bytes)>> {
        let mut scanners: Vec<Box<dyn RecordScanner>> = Vec::new();
        {
            let state = self.state.read();
            scanners.push(Box::new(MemTableScanner::new(state.mutable.clone(), start)));
            for f in state.frozen.iter().rev() {
                scanners.push(Box::new(MemTableScanner::new(f.mem.clone(), start)));
            }
            for sst in &state.sstables {
                scanners.push(Box::new(SSTableScanner::new(sst.clone(), start)));
            }
        }

        let mut merge = MergeScanner::new(scanners);
        let mut out = Vec::new();
        let mut last_key: Option<Vec<u8>> = None;
        while let Some(rec) = merge.next()? {
            let user_key = rec.key.user_key();
            if let Some(end) = end {
                if user_key >= end {
                    break;
                }
            }
            if last_key.as_deref() == Some(user_key) {
                continue;
            }
            last_key = Some(user_key.to_vec());
            if rec.kind == ValueKind::Put {
                out.push((rec.key.user_key_bytes().clone(), rec.value));
            }
        }
        Ok(out)
    }

    /// Rotates the WAL and freezes the mutable memtable.
    pub fn rotate_wal(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::WalClosed);
        }
        let guard = self.rotation_lock.lock();
        self.rotate_with_guard(guard)
    }

    /// Size-triggered rotation; re-checks the trigger under the rotation
    /// lock so racing writers do not rotate twice for one full memtable.
    fn maybe_rotate(&self) -> Result<()> {
        let guard = self.rotation_lock.lock();
        let still_needed = {
            let state = self.state.read();
            state.mutable.approximate_size() >= self.opts.memtable_size
                || self.wal.lock().size() >= self.opts.wal_max_size
        };
        if still_needed {
            self.rotate_with_guard(guard)
        } else {
            Ok(())
        }
    }

    fn rotate_with_guard(&self, _guard: MutexGuard<'_, ()>) -> Result<()> {
        self.rotating.store(true, Ordering::Release);
        let result = self.rotate_inner();
        self.rotating.store(false, Ordering::Release);
        result
    }

    fn rotate_inner(&self) -> Result<()> {
        let old = self.wal.lock().clone();
        // Writers hitting the old segment now bounce with WalRotating and
        // retry once the pointer below is swapped.
        old.set_rotating();

        let new_wal = match Wal::create(self.opts.clone(), &self.opts.wal_dir) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                old.set_active();
                return Err(e);
            }
        };
        new_wal.update_next_sequence(old.next_sequence());
        let new_name = new_wal
            .path()
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();

        let mut state = self.state.write();
        *self.wal.lock() = new_wal;
        old.close()?;

        state.mutable.set_immutable();
        let old_floor = std::mem::replace(&mut state.mutable_floor, new_name);
        let frozen = std::mem::replace(&mut state.mutable, Arc::new(MemTable::new()));
        state.frozen.push(FrozenMemTable {
            mem: frozen,
            wal_floor: old_floor,
        });
        debug!(pool = state.frozen.len(), "WAL rotated, memtable frozen");

        // Pool at capacity: rotation blocks until the oldest frozen table
        // has been flushed.
        if state.frozen.len() > self.opts.max_memtables {
            self.flush_oldest_locked(&mut state)?;
        }
        Ok(())
    }

    /// Spills every frozen memtable, oldest first, into new SSTables. A
    /// non-empty mutable memtable is frozen first so the flush covers it.
    /// Retired WAL segments are swept afterwards.
    pub fn flush_memtables(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::WalClosed);
        }
        let needs_freeze = !self.state.read().mutable.is_empty();
        if needs_freeze {
            self.rotate_wal()?;
        }
        let mut state = self.state.write();
        while !state.frozen.is_empty() {
            self.flush_oldest_locked(&mut state)?;
        }
        Ok(())
    }

    fn flush_oldest_locked(&self, state: &mut EngineState) -> Result<()> {
        if state.frozen.is_empty() {
            return Ok(());
        }
        let entry = state.frozen.remove(0);
        if let Some(reader) = self.write_table(&entry.mem)? {
            // Newly flushed tables are newer than everything on disk.
            state.sstables.insert(0, reader);
        }
        let keep_from = state.wal_floor();
        let _ = self.cleanup_tx.send(CleanupTask::SweepWal { keep_from });
        Ok(())
    }

    /// Writes the newest version of every key in `mem` to a fresh table,
    /// tombstones included. The table only becomes visible after the
    /// writer's rename and the reader registration both complete.
    fn write_table(&self, mem: &MemTable) -> Result<Option<Arc<SSTableReader>>> {
        if mem.is_empty() {
            debug!("skipping flush of empty memtable");
            return Ok(None);
        }
        let id = self.next_sst_id.fetch_add(1, Ordering::SeqCst);
        let path = filename::table_filename(&self.opts.sst_dir, id);
        let mut writer = SSTableWriter::new(self.opts.clone(), &path)?;

        let mut it = mem.new_iterator();
        it.seek_to_first();
        let mut last_key: Option<Vec<u8>> = None;
        while it.valid() {
            if last_key.as_deref() != Some(it.key()) {
                if it.is_tombstone() {
                    writer.add_tombstone(it.key(), it.seq())?;
                } else {
                    writer.add(it.key(), it.value(), it.seq())?;
                }
                last_key = Some(it.key().to_vec());
            }
            it.next();
        }

        let entries = writer.num_entries();
        writer.finish()?;
        let reader = Arc::new(SSTableReader::open(&path)?);
        info!(path = %path.display(), entries, "memtable flushed");
        Ok(Some(reader))
    }

    /// Flushes and fsyncs the WAL. Memtables are not flushed; recovery
    /// replays them on the next open.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let wal = self.wal.lock().clone();
        let res = wal.close();
        let _ = self.cleanup_tx.send(CleanupTask::Shutdown);
        if let Some(handle) = self.cleanup_thread.lock().take() {
            let _ = handle.join();
        }
        res
    }

    /// The live WAL handle; never dangling for the manager's lifetime.
    pub fn get_wal(&self) -> Arc<Wal> {
        self.wal.lock().clone()
    }

    pub fn is_rotating(&self) -> bool {
        self.rotating.load(Ordering::Acquire)
    }

    /// Registered table paths, newest first.
    pub fn get_sstables(&self) -> Vec<PathBuf> {
        self.state
            .read()
            .sstables
            .iter()
            .map(|r| r.path().to_path_buf())
            .collect()
    }

    /// Mutable table plus the frozen pool.
    pub fn memtable_count(&self) -> usize {
        1 + self.state.read().frozen.len()
    }

    pub fn recovery_stats(&self) -> RecoveryStats {
        self.recovery_stats
    }

    pub fn opts(&self) -> &Opts {
        &self.opts
    }
}

impl Drop for StorageManager {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn run_cleanup(wal_dir: PathBuf, rx: Receiver<CleanupTask>) {
    for task in rx {
        match task {
            CleanupTask::SweepWal { keep_from } => match filename::sorted_wal_files(&wal_dir) {
                Ok(files) => {
                    for path in files {
                        let retired = path
                            .file_name()
                            .map(|n| n < keep_from.as_os_str())
                            .unwrap_or(false);
                        if retired {
                            match std::fs::remove_file(&path) {
                                Ok(()) => debug!(path = %path.display(), "retired WAL segment"),
                                Err(e) => {
                                    warn!(path = %path.display(), error = %e, "failed to remove WAL segment")
                                }
                            }
                        }
                    }
                }
                Err(e) => warn!(error = %e, "WAL sweep failed"),
            },
            CleanupTask::Shutdown => break,
        }
    }
}
