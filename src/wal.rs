use crate::filename::{self, now_unix_ns};
use crate::key::ValueKind;
use crate::opts::{Opts, SyncMode};
use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::warn;

// Physical record types.
const RECORD_TYPE_FULL: u8 = 1;
const RECORD_TYPE_FIRST: u8 = 2;
const RECORD_TYPE_MIDDLE: u8 = 3;
const RECORD_TYPE_LAST: u8 = 4;

/// Physical record header: crc32 (4, LE, IEEE, over the payload),
/// length (2, LE), type (1).
pub const HEADER_SIZE: usize = 7;

/// Payload cap for one physical record; larger entries are fragmented.
pub const MAX_RECORD_SIZE: usize = 32 * 1024;

/// Hard cap on sequence numbers. A million numbers are held back so shutdown
/// and the final flush can still be logged after the first overflow error.
pub const MAX_SEQUENCE_NUMBER: u64 = u64::MAX - 1_000_000;

/// First sequence number at which the one-shot overflow warning fires.
pub const SEQUENCE_WARNING_THRESHOLD: u64 = u64::MAX - 10_000_000;

// Metadata prefix of a logical entry: op (1) + seq (8) + key_len (4).
const ENTRY_META_SIZE: usize = 1 + 8 + 4;

// Accounting header of a batch: count (4) + seq (8).
const BATCH_HEADER_SIZE: usize = 12;

const STATUS_ACTIVE: u32 = 0;
const STATUS_ROTATING: u32 = 1;
const STATUS_CLOSED: u32 = 2;

/// A logical entry carried by the WAL.
///
/// `value` is empty for deletes; the on-disk encoding omits the value
/// section entirely for them.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Entry {
    pub seq: u64,
    pub kind: ValueKind,
    pub key: Bytes,
    pub value: Bytes,
}

impl Entry {
    pub fn put(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Entry {
        Entry {
            seq: 0,
            kind: ValueKind::Put,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Bytes>) -> Entry {
        Entry {
            seq: 0,
            kind: ValueKind::Delete,
            key: key.into(),
            value: Bytes::new(),
        }
    }

    fn payload_size(&self) -> usize {
        let mut n = ENTRY_META_SIZE + self.key.len();
        if self.kind != ValueKind::Delete {
            n += 4 + self.value.len();
        }
        n
    }
}

/// Accumulates mutations for an atomic, single-sequence append.
#[derive(Clone, Debug, Default)]
pub struct Batch {
    entries: Vec<Entry>,
}

impl Batch {
    pub fn new() -> Batch {
        Batch::default()
    }

    pub fn put(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.entries.push(Entry::put(key, value));
    }

    pub fn delete(&mut self, key: impl Into<Bytes>) {
        self.entries.push(Entry::delete(key));
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Accounting size of the batch: a 12-byte header plus per-entry
    /// op/len fields and the key and value bytes.
    pub fn size(&self) -> usize {
        let mut n = BATCH_HEADER_SIZE;
        for e in &self.entries {
            n += 1 + 4 + e.key.len();
            if e.kind != ValueKind::Delete {
                n += 4 + e.value.len();
            }
        }
        n
    }

    /// Writes the batch through `wal` under one shared sequence number.
    /// Empty batches are rejected here; batches whose accounting size
    /// exceeds the record payload cap are rejected before anything is
    /// written.
    pub fn write(&self, wal: &Wal) -> Result<u64> {
        if self.entries.is_empty() {
            return Err(Error::EmptyBatch);
        }
        let size = self.size();
        if size > MAX_RECORD_SIZE {
            return Err(Error::BatchTooLarge {
                size,
                max: MAX_RECORD_SIZE,
            });
        }
        wal.append_batch(&self.entries)
    }
}

/// Callbacks fired synchronously under the WAL's internal locks; observers
/// must not block.
pub trait WalObserver: Send + Sync {
    fn on_entry_written(&self, entry: &Entry);
    fn on_batch_written(&self, start_seq: u64, entries: &[Entry]);
    fn on_sync(&self, up_to_seq: u64);
}

struct WalInner {
    writer: BufWriter<File>,
    next_seq: u64,
    bytes_written: u64,
    // Bytes accumulated since the last sync, for SyncMode::Batch.
    unsynced_bytes: u64,
    overflow_warned: bool,
}

/// A single write-ahead log segment.
///
/// Status transitions one way, Active -> Rotating -> Closed. Appends observe
/// the status lock-free and fail with `WalRotating`/`WalClosed` so callers
/// can retry against the manager's fresh segment.
pub struct Wal {
    opts: Opts,
    dir: PathBuf,
    path: PathBuf,
    status: AtomicU32,
    inner: Mutex<WalInner>,
    observers: RwLock<HashMap<String, Arc<dyn WalObserver>>>,
}

impl Wal {
    /// Creates a fresh segment in `dir`, named by creation time.
    pub fn create(opts: Opts, dir: impl AsRef<Path>) -> Result<Wal> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut ts = now_unix_ns();
        let (path, file) = loop {
            let path = filename::wal_filename(&dir, ts);
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(f) => break (path, f),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    ts += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };

        Ok(Wal {
            opts,
            dir,
            path,
            status: AtomicU32::new(STATUS_ACTIVE),
            inner: Mutex::new(WalInner {
                writer: BufWriter::with_capacity(64 * 1024, file),
                next_seq: 1,
                bytes_written: 0,
                unsynced_bytes: 0,
                overflow_warned: false,
            }),
            observers: RwLock::new(HashMap::new()),
        })
    }

    /// Reopens the newest segment in `dir` for appending, continuing at
    /// `next_seq`. Returns `None` when there is no segment or the newest one
    /// has already reached `wal_max_size`.
    pub fn reuse(opts: Opts, dir: impl AsRef<Path>, next_seq: u64) -> Result<Option<Wal>> {
        let dir = dir.as_ref().to_path_buf();
        let files = filename::sorted_wal_files(&dir)?;
        let path = match files.last() {
            Some(p) => p.clone(),
            None => return Ok(None),
        };

        let file = match OpenOptions::new().append(true).open(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot reopen WAL segment for append");
                return Ok(None);
            }
        };
        let size = file.metadata()?.len();
        if size >= opts.wal_max_size {
            return Ok(None);
        }

        Ok(Some(Wal {
            opts,
            dir,
            path,
            status: AtomicU32::new(STATUS_ACTIVE),
            inner: Mutex::new(WalInner {
                writer: BufWriter::with_capacity(64 * 1024, file),
                next_seq,
                bytes_written: size,
                unsynced_bytes: 0,
                overflow_warned: false,
            }),
            observers: RwLock::new(HashMap::new()),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn check_status(&self) -> Result<()> {
        match self.status.load(Ordering::Acquire) {
            STATUS_CLOSED => Err(Error::WalClosed),
            STATUS_ROTATING => Err(Error::WalRotating),
            _ => Ok(()),
        }
    }

    /// Appends one entry, assigning it the next sequence number.
    pub fn append(&self, kind: ValueKind, key: &[u8], value: &[u8]) -> Result<u64> {
        let mut inner = self.inner.lock();
        self.check_status()?;

        if inner.next_seq >= MAX_SEQUENCE_NUMBER {
            return Err(Error::SequenceOverflow);
        }
        self.warn_if_near_overflow(&mut inner);

        let seq = inner.next_seq;
        inner.next_seq += 1;

        write_entry(&mut inner, kind, seq, key, value)?;

        let entry = Entry {
            seq,
            kind,
            key: Bytes::copy_from_slice(key),
            value: Bytes::copy_from_slice(value),
        };
        self.notify_entry(&entry);

        self.maybe_sync(&mut inner)?;
        Ok(seq)
    }

    /// Appends one entry under a caller-supplied sequence number, raising
    /// `next_seq` past it. Used by replication to mirror a primary's log.
    pub fn append_with_sequence(
        &self,
        kind: ValueKind,
        key: &[u8],
        value: &[u8],
        seq: u64,
    ) -> Result<u64> {
        let mut inner = self.inner.lock();
        self.check_status()?;

        if seq >= MAX_SEQUENCE_NUMBER {
            return Err(Error::SequenceOverflow);
        }
        if seq >= inner.next_seq {
            inner.next_seq = seq + 1;
            self.warn_if_near_overflow(&mut inner);
        }

        write_entry(&mut inner, kind, seq, key, value)?;

        let entry = Entry {
            seq,
            kind,
            key: Bytes::copy_from_slice(key),
            value: Bytes::copy_from_slice(value),
        };
        self.notify_entry(&entry);

        self.maybe_sync(&mut inner)?;
        Ok(seq)
    }

    /// Appends a batch atomically. Every entry shares one sequence number
    /// and `next_seq` advances by exactly 1. The whole batch is staged in
    /// memory and handed to the file in a single write so it reaches the OS
    /// as one contiguous prefix.
    pub fn append_batch(&self, entries: &[Entry]) -> Result<u64> {
        let mut inner = self.inner.lock();
        self.check_status()?;

        if entries.is_empty() {
            return Ok(inner.next_seq);
        }
        if inner.next_seq >= MAX_SEQUENCE_NUMBER {
            return Err(Error::SequenceOverflow);
        }
        self.warn_if_near_overflow(&mut inner);

        let start_seq = inner.next_seq;
        self.write_batch_locked(&mut inner, entries, start_seq)?;
        inner.next_seq = start_seq + 1;

        self.notify_batch(start_seq, entries);
        self.maybe_sync(&mut inner)?;
        Ok(start_seq)
    }

    /// Batch append with a caller-supplied starting sequence (replication).
    pub fn append_batch_with_sequence(&self, entries: &[Entry], start_seq: u64) -> Result<u64> {
        let mut inner = self.inner.lock();
        self.check_status()?;

        if entries.is_empty() {
            return Ok(start_seq);
        }
        if start_seq >= MAX_SEQUENCE_NUMBER {
            return Err(Error::SequenceOverflow);
        }

        self.write_batch_locked(&mut inner, entries, start_seq)?;
        if start_seq + 1 > inner.next_seq {
            inner.next_seq = start_seq + 1;
            self.warn_if_near_overflow(&mut inner);
        }

        self.notify_batch(start_seq, entries);
        self.maybe_sync(&mut inner)?;
        Ok(start_seq)
    }

    fn write_batch_locked(
        &self,
        inner: &mut WalInner,
        entries: &[Entry],
        seq: u64,
    ) -> Result<()> {
        // Batch entries are written as Full records only; an entry too large
        // for one record cannot be part of a batch.
        let mut staged = BytesMut::new();
        for e in entries {
            let payload = e.payload_size();
            if payload > MAX_RECORD_SIZE {
                return Err(Error::BatchTooLarge {
                    size: payload,
                    max: MAX_RECORD_SIZE,
                });
            }
            let mut body = BytesMut::with_capacity(payload);
            encode_entry_payload(&mut body, e.kind, seq, &e.key, &e.value);
            frame_record(&mut staged, RECORD_TYPE_FULL, &body);
        }

        // Drain any buffered single-entry appends first, then hand the batch
        // to the OS in one write.
        inner.writer.flush()?;
        inner.writer.get_mut().write_all(&staged)?;
        inner.bytes_written += staged.len() as u64;
        inner.unsynced_bytes += staged.len() as u64;
        Ok(())
    }

    /// Writes an already-framed physical record verbatim, preserving
    /// byte-for-byte compatibility with the segment it was copied from.
    pub fn append_exact_bytes(&self, raw: &[u8], seq: u64) -> Result<u64> {
        let mut inner = self.inner.lock();
        self.check_status()?;

        if raw.len() < HEADER_SIZE {
            return Err(Error::CorruptRecord(format!(
                "raw record too small: {} bytes",
                raw.len()
            )));
        }
        let declared = u16::from_le_bytes([raw[4], raw[5]]) as usize;
        if raw.len() != HEADER_SIZE + declared {
            return Err(Error::CorruptRecord(format!(
                "raw record length mismatch: header says {} payload bytes, got {} total",
                declared,
                raw.len()
            )));
        }

        if seq >= inner.next_seq {
            inner.next_seq = seq + 1;
        }

        inner.writer.write_all(raw)?;
        inner.bytes_written += raw.len() as u64;
        inner.unsynced_bytes += raw.len() as u64;

        // The payload may be a fragment; only notify when the op byte is one
        // we can name.
        if let Some(kind) = ValueKind::from_u8(raw[HEADER_SIZE]) {
            let entry = Entry {
                seq,
                kind,
                key: Bytes::new(),
                value: Bytes::new(),
            };
            self.notify_entry(&entry);
        }

        self.maybe_sync(&mut inner)?;
        Ok(seq)
    }

    fn warn_if_near_overflow(&self, inner: &mut WalInner) {
        if inner.next_seq >= SEQUENCE_WARNING_THRESHOLD && !inner.overflow_warned {
            inner.overflow_warned = true;
            warn!(
                next_seq = inner.next_seq,
                "sequence numbers approaching overflow; plan a fresh database instance"
            );
        }
    }

    fn maybe_sync(&self, inner: &mut WalInner) -> Result<()> {
        let need = match self.opts.wal_sync_mode {
            SyncMode::Immediate => true,
            SyncMode::Batch => inner.unsynced_bytes >= self.opts.wal_sync_bytes,
            SyncMode::None => false,
        };
        if need {
            self.sync_locked(inner)?;
        }
        Ok(())
    }

    fn sync_locked(&self, inner: &mut WalInner) -> Result<()> {
        self.check_status()?;
        inner.writer.flush()?;
        inner.writer.get_ref().sync_all()?;
        inner.unsynced_bytes = 0;
        self.notify_sync(inner.next_seq.saturating_sub(1));
        Ok(())
    }

    /// Flushes buffered data and fsyncs the segment.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.sync_locked(&mut inner)
    }

    /// Flushes, fsyncs, and closes the segment. The flush happens before the
    /// status changes so in-flight buffered data is never dropped. Closing
    /// twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if self.status.load(Ordering::Acquire) == STATUS_CLOSED {
            return Ok(());
        }
        inner.writer.flush()?;
        inner.writer.get_ref().sync_all()?;
        self.status.store(STATUS_ROTATING, Ordering::Release);
        self.status.store(STATUS_CLOSED, Ordering::Release);
        Ok(())
    }

    pub fn set_rotating(&self) {
        self.status.store(STATUS_ROTATING, Ordering::Release);
    }

    pub fn set_active(&self) {
        self.status.store(STATUS_ACTIVE, Ordering::Release);
    }

    /// Raises `next_seq` to at least `seq`; used after recovery.
    pub fn update_next_sequence(&self, seq: u64) {
        let mut inner = self.inner.lock();
        if seq > inner.next_seq {
            inner.next_seq = seq;
            self.warn_if_near_overflow(&mut inner);
        }
    }

    pub fn next_sequence(&self) -> u64 {
        self.inner.lock().next_seq
    }

    /// Total bytes appended to this segment, used for rotation triggers.
    pub fn size(&self) -> u64 {
        self.inner.lock().bytes_written
    }

    pub fn register_observer(&self, id: impl Into<String>, observer: Arc<dyn WalObserver>) {
        self.observers.write().insert(id.into(), observer);
    }

    pub fn unregister_observer(&self, id: &str) {
        self.observers.write().remove(id);
    }

    fn notify_entry(&self, entry: &Entry) {
        for obs in self.observers.read().values() {
            obs.on_entry_written(entry);
        }
    }

    fn notify_batch(&self, start_seq: u64, entries: &[Entry]) {
        for obs in self.observers.read().values() {
            obs.on_batch_written(start_seq, entries);
        }
    }

    fn notify_sync(&self, up_to_seq: u64) {
        for obs in self.observers.read().values() {
            obs.on_sync(up_to_seq);
        }
    }

    /// Collects every logical entry with sequence >= `min_seq` across the
    /// directory's segments, oldest segment first with the current segment
    /// last. The in-memory buffer is drained first so readers observe
    /// consistent data. Corrupt records end the segment they appear in.
    pub fn entries_from(&self, min_seq: u64) -> Result<Vec<Entry>> {
        {
            let mut inner = self.inner.lock();
            if self.status.load(Ordering::Acquire) == STATUS_CLOSED {
                return Err(Error::WalClosed);
            }
            if min_seq >= inner.next_seq {
                return Ok(Vec::new());
            }
            inner.writer.flush()?;
        }

        let mut result = Vec::new();
        let mut collect = |path: &Path| -> Result<()> {
            let mut reader = WalReader::open(path)?;
            loop {
                match reader.read_entry() {
                    Ok(Some(e)) => {
                        if e.seq >= min_seq {
                            result.push(e);
                        }
                    }
                    Ok(None) => break,
                    Err(Error::CorruptRecord(_))
                    | Err(Error::InvalidRecordType(_))
                    | Err(Error::InvalidOpType(_)) => break,
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        };

        for path in filename::sorted_wal_files(&self.dir)? {
            if path == self.path {
                continue;
            }
            if let Err(e) = collect(&path) {
                warn!(path = %path.display(), error = %e, "skipping unreadable WAL segment");
            }
        }
        collect(&self.path)?;
        Ok(result)
    }

    #[cfg(test)]
    pub(crate) fn overflow_warned(&self) -> bool {
        self.inner.lock().overflow_warned
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn encode_entry_payload(dst: &mut BytesMut, kind: ValueKind, seq: u64, key: &[u8], value: &[u8]) {
    dst.put_u8(kind as u8);
    dst.put_u64_le(seq);
    dst.put_u32_le(key.len() as u32);
    dst.put_slice(key);
    if kind != ValueKind::Delete {
        dst.put_u32_le(value.len() as u32);
        dst.put_slice(value);
    }
}

fn frame_record(dst: &mut BytesMut, record_type: u8, payload: &[u8]) {
    debug_assert!(payload.len() <= MAX_RECORD_SIZE);
    dst.put_u32_le(crc32fast::hash(payload));
    dst.put_u16_le(payload.len() as u16);
    dst.put_u8(record_type);
    dst.put_slice(payload);
}

fn write_record(inner: &mut WalInner, record_type: u8, payload: &[u8]) -> Result<()> {
    let mut framed = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    frame_record(&mut framed, record_type, payload);
    inner.writer.write_all(&framed)?;
    inner.bytes_written += framed.len() as u64;
    inner.unsynced_bytes += framed.len() as u64;
    Ok(())
}

fn write_entry(
    inner: &mut WalInner,
    kind: ValueKind,
    seq: u64,
    key: &[u8],
    value: &[u8],
) -> Result<()> {
    let mut payload_size = ENTRY_META_SIZE + key.len();
    if kind != ValueKind::Delete {
        payload_size += 4 + value.len();
    }

    if payload_size <= MAX_RECORD_SIZE {
        let mut body = BytesMut::with_capacity(payload_size);
        encode_entry_payload(&mut body, kind, seq, key, value);
        return write_record(inner, RECORD_TYPE_FULL, &body);
    }

    // First fragment: the metadata prefix plus as much of the key as fits.
    let key_in_first = key.len().min(MAX_RECORD_SIZE - ENTRY_META_SIZE);
    let mut first = BytesMut::with_capacity(ENTRY_META_SIZE + key_in_first);
    first.put_u8(kind as u8);
    first.put_u64_le(seq);
    first.put_u32_le(key.len() as u32);
    first.put_slice(&key[..key_in_first]);
    write_record(inner, RECORD_TYPE_FIRST, &first)?;

    // The rest of the key and the value section stream out as one run of
    // Middle fragments with the tail in a Last.
    let mut remaining = BytesMut::new();
    remaining.put_slice(&key[key_in_first..]);
    if kind != ValueKind::Delete {
        remaining.put_u32_le(value.len() as u32);
        remaining.put_slice(value);
    }

    let mut rest: &[u8] = &remaining;
    while rest.len() > MAX_RECORD_SIZE {
        write_record(inner, RECORD_TYPE_MIDDLE, &rest[..MAX_RECORD_SIZE])?;
        rest = &rest[MAX_RECORD_SIZE..];
    }
    if !rest.is_empty() {
        write_record(inner, RECORD_TYPE_LAST, rest)?;
    }
    Ok(())
}

fn decode_entry_payload(mut payload: Bytes) -> Result<Entry> {
    if payload.len() < ENTRY_META_SIZE {
        return Err(Error::CorruptRecord("entry payload too short".into()));
    }
    let op = payload.get_u8();
    let kind = ValueKind::from_u8(op).ok_or(Error::InvalidOpType(op))?;
    let seq = payload.get_u64_le();
    let key_len = payload.get_u32_le() as usize;
    if payload.remaining() < key_len {
        return Err(Error::CorruptRecord("truncated key".into()));
    }
    let key = payload.split_to(key_len);

    let value = if kind == ValueKind::Delete {
        Bytes::new()
    } else {
        if payload.remaining() < 4 {
            return Err(Error::CorruptRecord("missing value length".into()));
        }
        let value_len = payload.get_u32_le() as usize;
        if payload.remaining() < value_len {
            return Err(Error::CorruptRecord("truncated value".into()));
        }
        payload.split_to(value_len)
    };
    if !payload.is_empty() {
        return Err(Error::CorruptRecord("trailing bytes after entry".into()));
    }
    Ok(Entry {
        seq,
        kind,
        key,
        value,
    })
}

/// Reads logical entries back out of one segment, reassembling fragmented
/// records and verifying every CRC.
pub struct WalReader {
    reader: BufReader<File>,
}

impl WalReader {
    pub fn open(path: impl AsRef<Path>) -> Result<WalReader> {
        Ok(WalReader {
            reader: BufReader::new(File::open(path)?),
        })
    }

    /// Next logical entry, or `None` at a clean end of segment. A torn or
    /// corrupt record surfaces as `CorruptRecord`; fragment runs broken by
    /// an unexpected record type are reported the same way.
    pub fn read_entry(&mut self) -> Result<Option<Entry>> {
        let mut partial: Option<BytesMut> = None;
        loop {
            let mut header = [0u8; HEADER_SIZE];
            match self.reader.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    if partial.is_some() {
                        return Err(Error::CorruptRecord(
                            "segment ended inside a fragmented entry".into(),
                        ));
                    }
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }

            let crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let len = u16::from_le_bytes([header[4], header[5]]) as usize;
            let record_type = header[6];

            let mut payload = vec![0u8; len];
            self.reader
                .read_exact(&mut payload)
                .map_err(|e| match e.kind() {
                    ErrorKind::UnexpectedEof => Error::CorruptRecord("truncated record".into()),
                    _ => Error::Io(e),
                })?;

            if crc32fast::hash(&payload) != crc {
                return Err(Error::CorruptRecord("checksum mismatch".into()));
            }

            match record_type {
                RECORD_TYPE_FULL => {
                    if partial.is_some() {
                        return Err(Error::CorruptRecord(
                            "full record inside a fragmented entry".into(),
                        ));
                    }
                    return decode_entry_payload(Bytes::from(payload)).map(Some);
                }
                RECORD_TYPE_FIRST => {
                    if partial.is_some() {
                        return Err(Error::CorruptRecord(
                            "first fragment inside a fragmented entry".into(),
                        ));
                    }
                    let mut buf = BytesMut::new();
                    buf.put_slice(&payload);
                    partial = Some(buf);
                }
                RECORD_TYPE_MIDDLE => match partial.as_mut() {
                    Some(buf) => buf.put_slice(&payload),
                    None => {
                        return Err(Error::CorruptRecord("orphan middle fragment".into()));
                    }
                },
                RECORD_TYPE_LAST => match partial.take() {
                    Some(mut buf) => {
                        buf.put_slice(&payload);
                        return decode_entry_payload(buf.freeze()).map(Some);
                    }
                    None => {
                        return Err(Error::CorruptRecord("orphan last fragment".into()));
                    }
                },
                other => return Err(Error::InvalidRecordType(other)),
            }
        }
    }
}

/// Counters from a replay pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReplayStats {
    pub segments_replayed: usize,
    pub entries_replayed: usize,
    pub corrupt_records: usize,
}

/// Replays one segment, calling `handler` for each logical entry in order.
/// Benign corruption terminates the segment without error; a handler error
/// aborts the replay and surfaces to the caller.
pub fn replay_wal_file(
    path: impl AsRef<Path>,
    handler: &mut dyn FnMut(&Entry) -> Result<()>,
) -> Result<ReplayStats> {
    let path = path.as_ref();
    let mut reader = WalReader::open(path)?;
    let mut stats = ReplayStats {
        segments_replayed: 1,
        ..ReplayStats::default()
    };
    loop {
        match reader.read_entry() {
            Ok(Some(entry)) => {
                handler(&entry)?;
                stats.entries_replayed += 1;
            }
            Ok(None) => break,
            Err(Error::CorruptRecord(msg)) => {
                warn!(path = %path.display(), %msg, "corrupt WAL record, ending segment replay");
                stats.corrupt_records += 1;
                break;
            }
            Err(Error::InvalidRecordType(t)) => {
                warn!(path = %path.display(), record_type = t, "unknown WAL record type, ending segment replay");
                stats.corrupt_records += 1;
                break;
            }
            Err(Error::InvalidOpType(t)) => {
                warn!(path = %path.display(), op = t, "unknown WAL op type, ending segment replay");
                stats.corrupt_records += 1;
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(stats)
}

/// Replays every segment in `dir` oldest-first. Corruption in one segment
/// does not prevent later segments from replaying.
pub fn replay_wal_dir(
    dir: impl AsRef<Path>,
    mut handler: impl FnMut(&Entry) -> Result<()>,
) -> Result<ReplayStats> {
    let mut stats = ReplayStats::default();
    for path in filename::sorted_wal_files(dir.as_ref())? {
        let s = replay_wal_file(&path, &mut handler)?;
        stats.segments_replayed += s.segments_replayed;
        stats.entries_replayed += s.entries_replayed;
        stats.corrupt_records += s.corrupt_records;
    }
    Ok(stats)
}
