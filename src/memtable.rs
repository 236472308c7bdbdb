use crate::key::{Record, ValueKind};
use crate::wal::Entry;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

pub mod recovery;
pub mod skiplist;

pub use recovery::{recover_from_wal, RecoveryOptions, RecoveryStats};
pub use skiplist::{SkipList, SkipListIter};

/// In-memory table of recent mutations.
///
/// Wraps the skip list with size accounting, the highest sequence number
/// seen, and a one-way immutability flag. Once `set_immutable` has been
/// called every mutation becomes a no-op; readers observe the flag with
/// acquire ordering and need no further synchronization because the
/// underlying list is lock-free.
#[derive(Debug)]
pub struct MemTable {
    list: SkipList,
    created_at: Instant,
    immutable: AtomicBool,
    max_seq: AtomicU64,
}

impl MemTable {
    pub fn new() -> MemTable {
        MemTable {
            list: SkipList::new(),
            created_at: Instant::now(),
            immutable: AtomicBool::new(false),
            max_seq: AtomicU64::new(0),
        }
    }

    pub fn put(&self, key: &[u8], value: &[u8], seq: u64) {
        if self.is_immutable() {
            return;
        }
        self.list.insert(Record::put(
            Bytes::copy_from_slice(key),
            seq,
            Bytes::copy_from_slice(value),
        ));
        self.max_seq.fetch_max(seq, Ordering::AcqRel);
    }

    pub fn delete(&self, key: &[u8], seq: u64) {
        if self.is_immutable() {
            return;
        }
        self.list
            .insert(Record::tombstone(Bytes::copy_from_slice(key), seq));
        self.max_seq.fetch_max(seq, Ordering::AcqRel);
    }

    /// Looks up the newest version of `key`.
    ///
    /// `None` means the key was never seen here; `Some(None)` means the
    /// newest version is a tombstone; `Some(Some(v))` is a live value.
    pub fn get(&self, key: &[u8]) -> Option<Option<Bytes>> {
        let rec = self.list.find(key)?;
        if rec.is_tombstone() {
            Some(None)
        } else {
            Some(Some(rec.value))
        }
    }

    /// Whether any record, tombstones included, exists for `key`.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.list.find(key).is_some()
    }

    pub fn approximate_size(&self) -> u64 {
        self.list.approximate_size()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// One-way transition; there is no way back to mutable.
    pub fn set_immutable(&self) {
        self.immutable.store(true, Ordering::Release);
    }

    pub fn is_immutable(&self) -> bool {
        self.immutable.load(Ordering::Acquire)
    }

    /// Age in seconds since creation.
    pub fn age(&self) -> f64 {
        self.created_at.elapsed().as_secs_f64()
    }

    pub fn max_sequence(&self) -> u64 {
        self.max_seq.load(Ordering::Acquire)
    }

    /// An iterator over this table. On a mutable table the current maximum
    /// sequence is captured as a snapshot so concurrent writers cannot leak
    /// newer records into the scan; a frozen table needs no snapshot.
    pub fn new_iterator(&self) -> SkipListIter<'_> {
        if self.is_immutable() {
            self.list.iter()
        } else {
            self.list.iter_with_snapshot(self.max_sequence())
        }
    }

    /// Applies a replayed WAL entry. Unknown kinds (including the reserved
    /// Merge tag) are ignored without advancing the max sequence.
    pub fn apply_wal_entry(&self, entry: &Entry) {
        match entry.kind {
            ValueKind::Put => self.put(&entry.key, &entry.value, entry.seq),
            ValueKind::Delete => self.delete(&entry.key, entry.seq),
            ValueKind::Merge => {}
        }
    }

    pub(crate) fn list(&self) -> &SkipList {
        &self.list
    }
}

impl Default for MemTable {
    fn default() -> Self {
        MemTable::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_put_get() {
        let m = MemTable::new();
        m.put(b"key1", b"value1", 1);
        assert_eq!(m.get(b"key1"), Some(Some(Bytes::from("value1"))));
        assert_eq!(m.get(b"missing"), None);
    }

    #[test]
    fn test_tombstone_shadows_put() {
        let m = MemTable::new();
        m.put(b"k", b"v", 1);
        m.delete(b"k", 2);
        assert_eq!(m.get(b"k"), Some(None));
        assert!(m.contains(b"k"));

        // A newer put shadows the tombstone again.
        m.put(b"k", b"v2", 3);
        assert_eq!(m.get(b"k"), Some(Some(Bytes::from("v2"))));
    }

    #[test]
    fn test_immutable_mutations_are_noops() {
        let m = MemTable::new();
        m.put(b"k", b"v", 1);
        m.set_immutable();
        assert!(m.is_immutable());

        m.put(b"k", b"changed", 2);
        m.delete(b"k", 3);
        assert_eq!(m.get(b"k"), Some(Some(Bytes::from("v"))));
        assert_eq!(m.max_sequence(), 1);
    }

    #[test]
    fn test_max_sequence_tracking() {
        let m = MemTable::new();
        m.put(b"a", b"1", 5);
        m.put(b"b", b"2", 3);
        assert_eq!(m.max_sequence(), 5);
        m.delete(b"a", 9);
        assert_eq!(m.max_sequence(), 9);
    }

    #[test]
    fn test_apply_wal_entry() {
        let m = MemTable::new();
        m.apply_wal_entry(&Entry {
            seq: 1,
            kind: ValueKind::Put,
            key: Bytes::from("k"),
            value: Bytes::from("v"),
        });
        assert_eq!(m.get(b"k"), Some(Some(Bytes::from("v"))));

        m.apply_wal_entry(&Entry {
            seq: 2,
            kind: ValueKind::Delete,
            key: Bytes::from("k"),
            value: Bytes::new(),
        });
        assert_eq!(m.get(b"k"), Some(None));

        // Merge is reserved: ignored, max sequence untouched.
        m.apply_wal_entry(&Entry {
            seq: 9,
            kind: ValueKind::Merge,
            key: Bytes::from("k"),
            value: Bytes::from("m"),
        });
        assert_eq!(m.get(b"k"), Some(None));
        assert_eq!(m.max_sequence(), 2);
    }

    #[test]
    fn test_mutable_iterator_snapshots_current_state() {
        let m = MemTable::new();
        m.put(b"a", b"1", 1);
        m.put(b"b", b"2", 2);

        let mut it = m.new_iterator();
        // Writes after iterator creation are invisible to it.
        m.put(b"c", b"3", 3);

        it.seek_to_first();
        let mut keys = Vec::new();
        while it.valid() {
            keys.push(it.key().to_vec());
            it.next();
        }
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_immutable_iterator_sees_everything() {
        let m = MemTable::new();
        m.put(b"a", b"1", 1);
        m.delete(b"b", 2);
        m.set_immutable();

        let mut it = m.new_iterator();
        it.seek_to_first();
        assert!(it.valid());
        assert_eq!(it.key(), b"a");
        it.next();
        assert!(it.valid());
        assert!(it.is_tombstone());
        it.next();
        assert!(!it.valid());
    }

    #[test]
    fn test_age_grows() {
        let m = MemTable::new();
        assert!(m.age() >= 0.0);
    }
}
