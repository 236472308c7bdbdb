use crate::key::{InternalKey, Record};
use crate::memtable::MemTable;
use crate::sstable::{SSTableIter, SSTableReader};
use crate::Result;
use std::cmp::Ordering;
use std::sync::Arc;

/// Pull-based scanner over internal records in (key ASC, seq DESC) order.
pub trait RecordScanner {
    fn next(&mut self) -> Result<Option<Record>>;
}

/// K-way merge over scanners that each yield internal-key order.
///
/// On an exact internal-key tie the earliest scanner wins, so callers place
/// newer sources first. Because the comparator already ranks newer versions
/// of a key ahead of older ones, the merged stream presents each user key's
/// newest record first.
pub struct MergeScanner {
    scanners: Vec<(Box<dyn RecordScanner>, Option<Record>)>,
}

impl MergeScanner {
    pub fn new(scanners: Vec<Box<dyn RecordScanner>>) -> MergeScanner {
        MergeScanner {
            scanners: scanners.into_iter().map(|s| (s, None)).collect(),
        }
    }
}

impl RecordScanner for MergeScanner {
    fn next(&mut self) -> Result<Option<Record>> {
        // Refill exhausted slots, dropping scanners that have run dry.
        loop {
            let mut finished = None;
            for (i, (s, slot)) in self.scanners.iter_mut().enumerate() {
                if slot.is_none() {
                    match s.next()? {
                        Some(rec) => *slot = Some(rec),
                        None => {
                            finished = Some(i);
                            break;
                        }
                    }
                }
            }
            match finished {
                Some(i) => {
                    self.scanners.remove(i);
                }
                None => break,
            }
        }
        if self.scanners.is_empty() {
            return Ok(None);
        }

        let mut min = 0;
        for i in 1..self.scanners.len() {
            let a = self.scanners[i].1.as_ref().expect("slot was refilled");
            let b = self.scanners[min].1.as_ref().expect("slot was refilled");
            if a.key.cmp(&b.key) == Ordering::Less {
                min = i;
            }
        }
        Ok(self.scanners[min].1.take())
    }
}

/// Scanner over one memtable, stepping the lock-free list by key so the
/// scan owns no borrow of the table.
pub struct MemTableScanner {
    mem: Arc<MemTable>,
    snapshot: Option<u64>,
    start: Option<Vec<u8>>,
    pos: Option<InternalKey>,
    done: bool,
}

impl MemTableScanner {
    /// Scans `mem` from `start` (or the beginning). A mutable table is
    /// scanned under a snapshot of its current max sequence; a frozen one
    /// needs no snapshot.
    pub fn new(mem: Arc<MemTable>, start: Option<&[u8]>) -> MemTableScanner {
        let snapshot = if mem.is_immutable() {
            None
        } else {
            Some(mem.max_sequence())
        };
        MemTableScanner {
            mem,
            snapshot,
            start: start.map(|k| k.to_vec()),
            pos: None,
            done: false,
        }
    }
}

impl RecordScanner for MemTableScanner {
    fn next(&mut self) -> Result<Option<Record>> {
        if self.done {
            return Ok(None);
        }
        let rec = match &self.pos {
            Some(pos) => self.mem.list().next_after(pos, self.snapshot),
            None => match &self.start {
                Some(k) => self.mem.list().seek(k, self.snapshot),
                None => self.mem.list().first(self.snapshot),
            },
        };
        match &rec {
            Some(r) => self.pos = Some(r.key.clone()),
            None => self.done = true,
        }
        Ok(rec)
    }
}

/// Scanner over one SSTable.
pub struct SSTableScanner {
    iter: SSTableIter,
    start: Option<Vec<u8>>,
    started: bool,
}

impl SSTableScanner {
    pub fn new(reader: Arc<SSTableReader>, start: Option<&[u8]>) -> SSTableScanner {
        SSTableScanner {
            iter: reader.new_iterator(),
            start: start.map(|s| s.to_vec()),
            started: false,
        }
    }
}

impl RecordScanner for SSTableScanner {
    fn next(&mut self) -> Result<Option<Record>> {
        if !self.started {
            self.started = true;
            match &self.start {
                Some(k) => self.iter.seek(k)?,
                None => self.iter.seek_to_first()?,
            }
        } else if self.iter.valid() {
            self.iter.next()?;
        }
        match self.iter.entry() {
            Some(e) => Ok(Some(Record {
                key: InternalKey::new(e.key.clone(), e.seq),
                kind: e.kind,
                value: e.value.clone(),
            })),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::key::ValueKind;

    struct VecScanner {
        items: std::vec::IntoIter<Record>,
    }

    impl VecScanner {
        fn new(mut items: Vec<Record>) -> VecScanner {
            items.sort_by(|a, b| a.key.cmp(&b.key));
            VecScanner {
                items: items.into_iter(),
            }
        }
    }

    impl RecordScanner for VecScanner {
        fn next(&mut self) -> Result<Option<Record>> {
            Ok(self.items.next())
        }
    }

    #[test]
    fn test_merge_interleaves_in_key_order() {
        let a = VecScanner::new(vec![
            Record::put("a", 1, "1"),
            Record::put("c", 3, "3"),
        ]);
        let b = VecScanner::new(vec![
            Record::put("b", 2, "2"),
            Record::put("d", 4, "4"),
        ]);
        let mut m = MergeScanner::new(vec![Box::new(a), Box::new(b)]);

        let mut keys = Vec::new();
        while let Some(r) = m.next().unwrap() {
            keys.push(r.key.user_key().to_vec());
        }
        assert_eq!(
            keys,
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );
    }

    #[test]
    fn test_merge_yields_newest_version_first() {
        let newer = VecScanner::new(vec![Record::put("k", 9, "new")]);
        let older = VecScanner::new(vec![
            Record::put("k", 3, "old"),
            Record::tombstone("k", 5),
        ]);
        let mut m = MergeScanner::new(vec![Box::new(newer), Box::new(older)]);

        let first = m.next().unwrap().unwrap();
        assert_eq!(first.key.seq(), 9);
        assert_eq!(first.value, "new");
        let second = m.next().unwrap().unwrap();
        assert_eq!(second.key.seq(), 5);
        assert_eq!(second.kind, ValueKind::Delete);
        let third = m.next().unwrap().unwrap();
        assert_eq!(third.key.seq(), 3);
        assert!(m.next().unwrap().is_none());
    }

    #[test]
    fn test_merge_empty_scanners() {
        let mut m = MergeScanner::new(vec![
            Box::new(VecScanner::new(vec![])) as Box<dyn RecordScanner>,
            Box::new(VecScanner::new(vec![Record::put("x", 1, "v")])),
        ]);
        assert_eq!(m.next().unwrap().unwrap().key.user_key(), b"x");
        assert!(m.next().unwrap().is_none());
        assert!(m.next().unwrap().is_none());
    }

    #[test]
    fn test_memtable_scanner_with_start() {
        let mem = Arc::new(MemTable::new());
        for (i, k) in ["apple", "banana", "cherry"].iter().enumerate() {
            mem.put(k.as_bytes(), b"v", i as u64 + 1);
        }
        let mut s = MemTableScanner::new(mem, Some(b"b"));
        assert_eq!(s.next().unwrap().unwrap().key.user_key(), b"banana");
        assert_eq!(s.next().unwrap().unwrap().key.user_key(), b"cherry");
        assert!(s.next().unwrap().is_none());
    }
}
