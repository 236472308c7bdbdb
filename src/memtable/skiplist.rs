use crate::key::{InternalKey, Record, ValueKind};
use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};

/// Ordered multi-version map of internal records.
///
/// Backed by a lock-free skip list keyed on `InternalKey`, so the (user key
/// ascending, sequence descending) comparator drives the physical order and
/// the newest version of a key is always the first of its cohort. Reads
/// never take a lock, which is what lets frozen memtables be scanned while
/// a flush is running.
#[derive(Debug)]
pub struct SkipList {
    map: SkipMap<InternalKey, (ValueKind, Bytes)>,
    size: AtomicU64,
}

fn visible(key: &InternalKey, snapshot: Option<u64>) -> bool {
    match snapshot {
        Some(s) => key.seq() <= s,
        None => true,
    }
}

impl SkipList {
    pub fn new() -> SkipList {
        SkipList {
            map: SkipMap::new(),
            size: AtomicU64::new(0),
        }
    }

    /// Inserts a record. An insert at an existing (key, seq) replaces the
    /// previous record, which is how a batch resolves duplicate keys.
    pub fn insert(&self, record: Record) {
        self.size.fetch_add(record.size() as u64, Ordering::Relaxed);
        self.map
            .insert(record.key, (record.kind, record.value));
    }

    /// The newest version of `user_key`, tombstones included.
    pub fn find(&self, user_key: &[u8]) -> Option<Record> {
        let probe = InternalKey::lookup(Bytes::copy_from_slice(user_key));
        let entry = self.map.range(probe..).next()?;
        if entry.key().user_key() != user_key {
            return None;
        }
        Some(Record {
            key: entry.key().clone(),
            kind: entry.value().0,
            value: entry.value().1.clone(),
        })
    }

    pub fn approximate_size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterator over every record in internal-key order.
    pub fn iter(&self) -> SkipListIter<'_> {
        SkipListIter {
            list: self,
            snapshot: None,
            current: None,
        }
    }

    /// Iterator that hides records with a sequence above `snapshot_seq`,
    /// shielding the reader from writes that land after the iterator was
    /// created.
    pub fn iter_with_snapshot(&self, snapshot_seq: u64) -> SkipListIter<'_> {
        SkipListIter {
            list: self,
            snapshot: Some(snapshot_seq),
            current: None,
        }
    }

    pub(crate) fn first(&self, snapshot: Option<u64>) -> Option<Record> {
        self.map
            .iter()
            .find(|e| visible(e.key(), snapshot))
            .map(|e| Record {
                key: e.key().clone(),
                kind: e.value().0,
                value: e.value().1.clone(),
            })
    }

    pub(crate) fn next_after(&self, pos: &InternalKey, snapshot: Option<u64>) -> Option<Record> {
        self.map
            .range((Bound::Excluded(pos.clone()), Bound::Unbounded))
            .find(|e| visible(e.key(), snapshot))
            .map(|e| Record {
                key: e.key().clone(),
                kind: e.value().0,
                value: e.value().1.clone(),
            })
    }

    /// First visible record whose user key is >= `user_key`.
    pub(crate) fn seek(&self, user_key: &[u8], snapshot: Option<u64>) -> Option<Record> {
        let probe = InternalKey::lookup(Bytes::copy_from_slice(user_key));
        self.map
            .range(probe..)
            .find(|e| visible(e.key(), snapshot))
            .map(|e| Record {
                key: e.key().clone(),
                kind: e.value().0,
                value: e.value().1.clone(),
            })
    }
}

impl Default for SkipList {
    fn default() -> Self {
        SkipList::new()
    }
}

/// Cursor over a skip list. Callers position it with `seek_to_first` or
/// `seek`, then step with `next` while `valid()` holds.
pub struct SkipListIter<'a> {
    list: &'a SkipList,
    snapshot: Option<u64>,
    current: Option<Record>,
}

impl<'a> SkipListIter<'a> {
    pub fn seek_to_first(&mut self) {
        self.current = self.list.first(self.snapshot);
    }

    pub fn seek(&mut self, user_key: &[u8]) {
        self.current = self.list.seek(user_key, self.snapshot);
    }

    pub fn next(&mut self) {
        if let Some(cur) = self.current.take() {
            self.current = self.list.next_after(&cur.key, self.snapshot);
        }
    }

    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    pub fn record(&self) -> Option<&Record> {
        self.current.as_ref()
    }

    pub fn key(&self) -> &[u8] {
        self.current.as_ref().expect("iterator is not valid").key.user_key()
    }

    pub fn seq(&self) -> u64 {
        self.current.as_ref().expect("iterator is not valid").key.seq()
    }

    pub fn value(&self) -> &[u8] {
        self.current.as_ref().expect("iterator is not valid").value.as_ref()
    }

    pub fn is_tombstone(&self) -> bool {
        self.current
            .as_ref()
            .expect("iterator is not valid")
            .is_tombstone()
    }
}
