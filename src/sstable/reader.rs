use crate::filter::bloom_may_contain;
use crate::key::ValueKind;
use crate::sstable::block::{Block, BlockEntry};
use crate::sstable::footer::{Footer, FOOTER_SIZE};
use crate::sstable::writer::IndexEntry;
use crate::{Error, Result};
use bytes::{Buf, Bytes};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Read handle for one immutable sorted run.
///
/// The footer is read and validated on open; the block index and bloom
/// filter are loaded lazily on first use and cached for the life of the
/// reader.
pub struct SSTableReader {
    path: PathBuf,
    file: Mutex<File>,
    file_size: u64,
    footer: Footer,
    index: OnceCell<Vec<IndexEntry>>,
    bloom: OnceCell<Option<Bytes>>,
}

impl SSTableReader {
    pub fn open(path: impl AsRef<Path>) -> Result<SSTableReader> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let file_size = file.metadata()?.len();
        if file_size < FOOTER_SIZE as u64 {
            return Err(Error::InvalidTable(format!(
                "file too small to hold a footer: {} bytes",
                file_size
            )));
        }

        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut raw = [0u8; FOOTER_SIZE];
        file.read_exact(&mut raw)?;
        let footer = Footer::decode(&raw)?;
        footer.validate(file_size)?;

        Ok(SSTableReader {
            path,
            file: Mutex::new(file),
            file_size,
            footer,
            index: OnceCell::new(),
            bloom: OnceCell::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_entries(&self) -> u64 {
        self.footer.num_entries
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    fn read_region(&self, offset: u64, size: u64) -> Result<Bytes> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; size as usize];
        file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn index(&self) -> Result<&Vec<IndexEntry>> {
        self.index.get_or_try_init(|| {
            let raw = self.read_region(self.footer.index_offset, self.footer.index_size)?;
            decode_index(raw)
        })
    }

    fn bloom(&self) -> Result<Option<&Bytes>> {
        let cell = self.bloom.get_or_try_init(|| -> Result<Option<Bytes>> {
            if self.footer.bloom_offset == 0 {
                return Ok(None);
            }
            let raw = self.read_region(self.footer.bloom_offset, self.footer.bloom_size)?;
            Ok(Some(raw))
        })?;
        Ok(cell.as_ref())
    }

    pub(crate) fn block_count(&self) -> Result<usize> {
        Ok(self.index()?.len())
    }

    pub(crate) fn load_block_at(&self, i: usize) -> Result<Block> {
        let idx = self.index()?;
        let entry = idx.get(i).ok_or_else(|| {
            Error::InvalidTable(format!("block {} out of range ({})", i, idx.len()))
        })?;
        let raw = self.read_region(entry.offset, entry.size)?;
        Block::decode(raw)
    }

    /// Index position of the block that could hold `key`: the last block
    /// whose first key is <= `key`.
    fn candidate_block(&self, key: &[u8]) -> Result<Option<usize>> {
        let idx = self.index()?;
        match idx.binary_search_by(|e| e.first_key.as_ref().cmp(key)) {
            Ok(i) => Ok(Some(i)),
            Err(0) => Ok(None),
            Err(i) => Ok(Some(i - 1)),
        }
    }

    /// Point lookup. Returns the newest record stored for `key`, tombstones
    /// included, or `None` when the table cannot contain it.
    pub fn get(&self, key: &[u8]) -> Result<Option<(ValueKind, Bytes)>> {
        if let Some(filter) = self.bloom()? {
            if !bloom_may_contain(filter, key) {
                return Ok(None);
            }
        }
        let block_idx = match self.candidate_block(key)? {
            Some(i) => i,
            None => return Ok(None),
        };
        let block = self.load_block_at(block_idx)?;
        let mut it = block.iter();
        while let Some(entry) = it.next_entry()? {
            match entry.key.as_ref().cmp(key) {
                std::cmp::Ordering::Less => continue,
                // Records sort newest-first within a key, so the first hit
                // is the newest version.
                std::cmp::Ordering::Equal => return Ok(Some((entry.kind, entry.value))),
                std::cmp::Ordering::Greater => return Ok(None),
            }
        }
        Ok(None)
    }

    /// Full-table cursor in key order.
    pub fn new_iterator(self: &Arc<Self>) -> SSTableIter {
        SSTableIter::new(self.clone())
    }
}

fn decode_index(mut raw: Bytes) -> Result<Vec<IndexEntry>> {
    let corrupt = |msg: &str| Error::InvalidTable(format!("index: {}", msg));
    if raw.remaining() < 4 {
        return Err(corrupt("missing entry count"));
    }
    let count = raw.get_u32_le() as usize;
    let mut entries: Vec<IndexEntry> = Vec::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        if raw.remaining() < 4 {
            return Err(corrupt("truncated key length"));
        }
        let key_len = raw.get_u32_le() as usize;
        if raw.remaining() < key_len + 16 {
            return Err(corrupt("truncated entry"));
        }
        let first_key = raw.split_to(key_len);
        let offset = raw.get_u64_le();
        let size = raw.get_u64_le();
        if let Some(prev) = entries.last() {
            if first_key <= prev.first_key {
                return Err(corrupt("block keys not ascending"));
            }
        }
        entries.push(IndexEntry {
            first_key,
            offset,
            size,
        });
    }
    if !raw.is_empty() {
        return Err(corrupt("trailing bytes"));
    }
    Ok(entries)
}

/// Cursor over every record of a table, blocks in index order.
pub struct SSTableIter {
    reader: Arc<SSTableReader>,
    block_idx: usize,
    block: Option<Block>,
    pos: usize,
    prev_key: Option<Bytes>,
    current: Option<BlockEntry>,
}

impl SSTableIter {
    pub fn new(reader: Arc<SSTableReader>) -> SSTableIter {
        SSTableIter {
            reader,
            block_idx: 0,
            block: None,
            pos: 0,
            prev_key: None,
            current: None,
        }
    }

    pub fn seek_to_first(&mut self) -> Result<()> {
        self.block_idx = 0;
        self.block = None;
        self.pos = 0;
        self.prev_key = None;
        self.current = None;
        self.advance()
    }

    /// Positions at the first record whose user key is >= `key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<()> {
        let start_block = match self.reader.candidate_block(key)? {
            Some(i) => i,
            None => 0,
        };
        self.block_idx = start_block;
        self.block = Some(self.reader.load_block_at(start_block)?);
        self.pos = 0;
        self.prev_key = None;
        self.current = None;
        self.advance()?;
        while self.valid() && self.key() < key {
            self.next()?;
        }
        Ok(())
    }

    /// Steps to the next record; `valid()` turns false at the end.
    pub fn next(&mut self) -> Result<()> {
        self.advance()
    }

    fn advance(&mut self) -> Result<()> {
        loop {
            if self.block.is_none() {
                if self.block_idx >= self.reader.block_count()? {
                    self.current = None;
                    return Ok(());
                }
                self.block = Some(self.reader.load_block_at(self.block_idx)?);
                self.pos = 0;
                self.prev_key = None;
            }
            let block = self.block.as_ref().expect("block was just loaded");
            if self.pos >= block.entry_area_len() {
                self.block = None;
                self.block_idx += 1;
                continue;
            }
            let (entry, next_pos) = block.decode_entry(self.pos, self.prev_key.as_deref())?;
            self.pos = next_pos;
            self.prev_key = Some(entry.key.clone());
            self.current = Some(entry);
            return Ok(());
        }
    }

    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    pub fn key(&self) -> &[u8] {
        self.current.as_ref().expect("iterator is not valid").key.as_ref()
    }

    pub fn value(&self) -> &[u8] {
        self.current
            .as_ref()
            .expect("iterator is not valid")
            .value
            .as_ref()
    }

    pub fn seq(&self) -> u64 {
        self.current.as_ref().expect("iterator is not valid").seq
    }

    pub fn kind(&self) -> ValueKind {
        self.current.as_ref().expect("iterator is not valid").kind
    }

    pub fn is_tombstone(&self) -> bool {
        self.kind() == ValueKind::Delete
    }

    pub(crate) fn entry(&self) -> Option<&BlockEntry> {
        self.current.as_ref()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::opts::OptsRaw;
    use crate::sstable::footer::CURRENT_VERSION;
    use crate::sstable::writer::SSTableWriter;
    use std::io::Write as _;
    use tempfile::tempdir;

    fn write_table(path: &Path, n: usize) {
        let opts = Arc::new(OptsRaw {
            block_size: 256,
            ..OptsRaw::default()
        });
        let mut w = SSTableWriter::new(opts, path).unwrap();
        for i in 0..n {
            w.add(
                format!("key:{:04}", i).as_bytes(),
                format!("value:{}", i).as_bytes(),
                i as u64,
            )
            .unwrap();
        }
        w.finish().unwrap();
    }

    #[test]
    fn test_iteration_matches_write_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.sst");
        write_table(&path, 200);

        let reader = Arc::new(SSTableReader::open(&path).unwrap());
        let mut it = reader.new_iterator();
        it.seek_to_first().unwrap();
        let mut count = 0;
        while it.valid() {
            assert_eq!(it.key(), format!("key:{:04}", count).as_bytes());
            assert_eq!(it.value(), format!("value:{}", count).as_bytes());
            assert_eq!(it.seq(), count as u64);
            it.next().unwrap();
            count += 1;
        }
        assert_eq!(count, 200);
    }

    #[test]
    fn test_seek_positions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.sst");
        write_table(&path, 100);
        let reader = Arc::new(SSTableReader::open(&path).unwrap());

        let mut it = reader.new_iterator();
        it.seek(b"key:0042").unwrap();
        assert!(it.valid());
        assert_eq!(it.key(), b"key:0042");

        it.seek(b"key:00425").unwrap();
        assert!(it.valid());
        assert_eq!(it.key(), b"key:0043");

        it.seek(b"a").unwrap();
        assert!(it.valid());
        assert_eq!(it.key(), b"key:0000");

        it.seek(b"zzz").unwrap();
        assert!(!it.valid());
    }

    #[test]
    fn test_get_bloom_rejects_absent_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.sst");
        write_table(&path, 50);
        let reader = SSTableReader::open(&path).unwrap();
        assert!(reader.get(b"key:0010").unwrap().is_some());
        assert!(reader.get(b"nope").unwrap().is_none());
    }

    #[test]
    fn test_open_rejects_malicious_footer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("evil.sst");
        let mut f = File::create(&path).unwrap();
        f.write_all(&[0u8; 1000]).unwrap();
        let footer = Footer {
            version: CURRENT_VERSION,
            index_offset: 10_000,
            index_size: 100,
            num_entries: 1,
            bloom_offset: 0,
            bloom_size: 0,
        };
        f.write_all(&footer.encode()).unwrap();
        drop(f);
        assert!(SSTableReader::open(&path).is_err());
    }

    #[test]
    fn test_open_rejects_bloom_past_eof() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("evil.sst");
        let mut f = File::create(&path).unwrap();
        f.write_all(&[0u8; 1000]).unwrap();
        let footer = Footer {
            version: CURRENT_VERSION,
            index_offset: 100,
            index_size: 100,
            num_entries: 1,
            bloom_offset: 2000,
            bloom_size: 64,
        };
        f.write_all(&footer.encode()).unwrap();
        drop(f);
        assert!(SSTableReader::open(&path).is_err());
    }

    #[test]
    fn test_open_rejects_tiny_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tiny.sst");
        std::fs::write(&path, b"short").unwrap();
        assert!(SSTableReader::open(&path).is_err());
    }

    #[test]
    fn test_reopen_preserves_records_exactly() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.sst");
        let opts = Arc::new(OptsRaw {
            block_size: 128,
            ..OptsRaw::default()
        });
        let mut w = SSTableWriter::new(opts, &path).unwrap();
        w.add(b"", b"empty-key", 1).unwrap();
        w.add(b"a", b"", 2).unwrap();
        w.add_tombstone(b"b", 3).unwrap();
        w.add(b"same", b"same", 4).unwrap();
        w.finish().unwrap();

        let reader = Arc::new(SSTableReader::open(&path).unwrap());
        let mut it = reader.new_iterator();
        it.seek_to_first().unwrap();

        let mut rows = Vec::new();
        while it.valid() {
            rows.push((
                it.key().to_vec(),
                it.kind(),
                it.seq(),
                it.value().to_vec(),
            ));
            it.next().unwrap();
        }
        assert_eq!(
            rows,
            vec![
                (b"".to_vec(), ValueKind::Put, 1, b"empty-key".to_vec()),
                (b"a".to_vec(), ValueKind::Put, 2, b"".to_vec()),
                (b"b".to_vec(), ValueKind::Delete, 3, b"".to_vec()),
                (b"same".to_vec(), ValueKind::Put, 4, b"same".to_vec()),
            ]
        );
    }
}
