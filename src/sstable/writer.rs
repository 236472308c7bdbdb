use crate::filter::BloomFilterBuilder;
use crate::key::ValueKind;
use crate::opts::Opts;
use crate::sstable::block::BlockBuilder;
use crate::sstable::footer::{Footer, CURRENT_VERSION};
use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

/// Builds one immutable sorted run.
///
/// Records accumulate into a temp file next to the target path; `finish`
/// seals the file (index, optional bloom filter, footer), fsyncs it, and
/// atomically renames it into place. Until then the table does not exist as
/// far as readers are concerned.
pub struct SSTableWriter {
    opts: Opts,
    path: PathBuf,
    tmp_path: PathBuf,
    file: Option<File>,
    block: BlockBuilder,
    index: Vec<IndexEntry>,
    bloom: BloomFilterBuilder,
    offset: u64,
    num_entries: u64,
    last_key: Option<Bytes>,
    finished: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IndexEntry {
    pub first_key: Bytes,
    pub offset: u64,
    pub size: u64,
}

pub(crate) fn encode_index(entries: &[IndexEntry]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32_le(entries.len() as u32);
    for e in entries {
        buf.put_u32_le(e.first_key.len() as u32);
        buf.put_slice(&e.first_key);
        buf.put_u64_le(e.offset);
        buf.put_u64_le(e.size);
    }
    buf
}

impl SSTableWriter {
    pub fn new(opts: Opts, path: impl Into<PathBuf>) -> Result<SSTableWriter> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = match path.file_name() {
            Some(name) => {
                let mut n = name.to_os_string();
                n.push(".tmp");
                path.with_file_name(n)
            }
            None => {
                return Err(Error::InvalidTable(format!(
                    "not a file path: {}",
                    path.display()
                )))
            }
        };
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        let bloom = BloomFilterBuilder::new(opts.bloom_bits_per_key);
        let block = BlockBuilder::new(opts.get_block_restart_interval());
        Ok(SSTableWriter {
            opts,
            path,
            tmp_path,
            file: Some(file),
            block,
            index: Vec::new(),
            bloom,
            offset: 0,
            num_entries: 0,
            last_key: None,
            finished: false,
        })
    }

    /// Appends a live record. Keys must arrive in strictly ascending order;
    /// duplicates are rejected.
    pub fn add(&mut self, key: &[u8], value: &[u8], seq: u64) -> Result<()> {
        self.add_record(key, ValueKind::Put, seq, value)
    }

    /// Appends a deletion marker. Tombstones are materialized with a zero
    /// length value so deletions survive the flush.
    pub fn add_tombstone(&mut self, key: &[u8], seq: u64) -> Result<()> {
        self.add_record(key, ValueKind::Delete, seq, b"")
    }

    fn add_record(&mut self, key: &[u8], kind: ValueKind, seq: u64, value: &[u8]) -> Result<()> {
        // The block encoding carries key lengths in 16-bit fields, under the
        // 64 KiB ceiling enforced on decode.
        if key.len() > u16::MAX as usize {
            return Err(Error::InvalidTable(format!(
                "key length {} exceeds the {} byte table limit",
                key.len(),
                u16::MAX
            )));
        }
        if let Some(last) = &self.last_key {
            if key <= last.as_ref() {
                return Err(Error::InvalidTable(format!(
                    "keys must be strictly ascending: {:?} after {:?}",
                    key, last
                )));
            }
        }
        self.last_key = Some(Bytes::copy_from_slice(key));

        if self.opts.bloom_bits_per_key > 0 {
            self.bloom.add_key(key);
        }
        self.block.add(key, kind, seq, value);
        self.num_entries += 1;

        if self.block.size_estimate() >= self.opts.get_block_size() {
            self.cut_block()?;
        }
        Ok(())
    }

    fn cut_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let next = BlockBuilder::new(self.opts.get_block_restart_interval());
        let block = std::mem::replace(&mut self.block, next);
        let first_key = block
            .first_key()
            .cloned()
            .ok_or_else(|| Error::InvalidTable("block with entries but no first key".into()))?;
        let data = block.finish();

        let file = self.file_mut()?;
        file.write_all(&data)?;
        self.index.push(IndexEntry {
            first_key,
            offset: self.offset,
            size: data.len() as u64,
        });
        self.offset += data.len() as u64;
        Ok(())
    }

    fn file_mut(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| Error::InvalidTable("writer already finalized".into()))
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Seals the table: flushes the open block, writes the index, the bloom
    /// filter when one was built, and the footer; fsyncs; renames the temp
    /// file onto the target path. Close errors are reported even when every
    /// earlier step succeeded.
    pub fn finish(mut self) -> Result<()> {
        if self.num_entries == 0 {
            return Err(Error::InvalidTable(
                "cannot finalize a table with no entries".into(),
            ));
        }
        self.cut_block()?;

        let index_offset = self.offset;
        let index_data = encode_index(&self.index);
        let file = self.file_mut()?;
        file.write_all(&index_data)?;
        let index_size = index_data.len() as u64;
        self.offset += index_size;

        let (bloom_offset, bloom_size) = if self.bloom.is_empty() {
            (0, 0)
        } else {
            let filter = self.bloom.finish();
            let file = self.file_mut()?;
            file.write_all(&filter)?;
            let at = self.offset;
            self.offset += filter.len() as u64;
            (at, filter.len() as u64)
        };

        let footer = Footer {
            version: CURRENT_VERSION,
            index_offset,
            index_size,
            num_entries: self.num_entries,
            bloom_offset,
            bloom_size,
        };
        let footer_data = footer.encode();
        self.file_mut()?.write_all(&footer_data)?;

        // Sync on the owned handle so a failing close surfaces here instead
        // of being swallowed by the drop; a success up to this point must
        // not mask it.
        let file = self.file.take().ok_or_else(|| {
            Error::InvalidTable("writer already finalized".into())
        })?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&self.tmp_path, &self.path)?;
        self.finished = true;
        Ok(())
    }

    /// Aborts the write and removes the temp file. Errors (for instance a
    /// temp file that was already removed) are reported to the caller.
    pub fn cleanup(mut self) -> Result<()> {
        self.file = None;
        self.finished = true;
        std::fs::remove_file(&self.tmp_path)?;
        Ok(())
    }
}

impl Drop for SSTableWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.file = None;
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::opts::OptsRaw;
    use crate::sstable::reader::SSTableReader;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn small_block_opts() -> Opts {
        Arc::new(OptsRaw {
            block_size: 256,
            ..OptsRaw::default()
        })
    }

    #[test]
    fn test_write_then_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0000000001.sst");
        let mut w = SSTableWriter::new(small_block_opts(), &path).unwrap();
        for i in 0..100 {
            w.add(
                format!("key:{:04}", i).as_bytes(),
                format!("value:{}", i).as_bytes(),
                i as u64,
            )
            .unwrap();
        }
        w.finish().unwrap();
        assert!(path.exists());
        assert!(!path.with_file_name("0000000001.sst.tmp").exists());

        let reader = SSTableReader::open(&path).unwrap();
        assert_eq!(reader.num_entries(), 100);
        for i in (0..100).step_by(7) {
            let (kind, value) = reader
                .get(format!("key:{:04}", i).as_bytes())
                .unwrap()
                .expect("key should be present");
            assert_eq!(kind, ValueKind::Put);
            assert_eq!(value, format!("value:{}", i).as_bytes());
        }
        assert!(reader.get(b"key:9999").unwrap().is_none());
    }

    #[test]
    fn test_out_of_order_and_duplicate_keys_rejected() {
        let dir = tempdir().unwrap();
        let mut w =
            SSTableWriter::new(small_block_opts(), dir.path().join("t.sst")).unwrap();
        w.add(b"bbb", b"1", 1).unwrap();
        assert!(w.add(b"aaa", b"2", 2).is_err());
        assert!(w.add(b"bbb", b"3", 3).is_err());
        w.add(b"ccc", b"4", 4).unwrap();
    }

    #[test]
    fn test_oversized_key_rejected() {
        let dir = tempdir().unwrap();
        let mut w =
            SSTableWriter::new(small_block_opts(), dir.path().join("t.sst")).unwrap();
        let big = vec![0u8; 70 * 1024];
        assert!(w.add(&big, b"v", 1).is_err());
    }

    #[test]
    fn test_empty_table_rejected() {
        let dir = tempdir().unwrap();
        let w = SSTableWriter::new(small_block_opts(), dir.path().join("t.sst")).unwrap();
        assert!(w.finish().is_err());
    }

    #[test]
    fn test_cleanup_removes_temp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.sst");
        let tmp = dir.path().join("t.sst.tmp");
        let mut w = SSTableWriter::new(small_block_opts(), &path).unwrap();
        w.add(b"k", b"v", 1).unwrap();
        assert!(tmp.exists());
        w.cleanup().unwrap();
        assert!(!tmp.exists());
        assert!(!path.exists());
    }

    #[test]
    fn test_cleanup_missing_temp_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.sst");
        let tmp = dir.path().join("t.sst.tmp");
        let w = SSTableWriter::new(small_block_opts(), &path).unwrap();
        std::fs::remove_file(&tmp).unwrap();
        assert!(w.cleanup().is_err());
    }

    #[test]
    fn test_drop_without_finish_removes_temp() {
        let dir = tempdir().unwrap();
        let tmp = dir.path().join("t.sst.tmp");
        {
            let mut w =
                SSTableWriter::new(small_block_opts(), dir.path().join("t.sst")).unwrap();
            w.add(b"k", b"v", 1).unwrap();
            assert!(tmp.exists());
        }
        assert!(!tmp.exists());
    }

    #[test]
    fn test_tombstones_preserved() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.sst");
        let mut w = SSTableWriter::new(small_block_opts(), &path).unwrap();
        w.add(b"alive", b"v", 5).unwrap();
        w.add_tombstone(b"dead", 6).unwrap();
        w.finish().unwrap();

        let reader = SSTableReader::open(&path).unwrap();
        let (kind, value) = reader.get(b"dead").unwrap().unwrap();
        assert_eq!(kind, ValueKind::Delete);
        assert!(value.is_empty());
    }
}
