use crate::key::ValueKind;
use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Ceiling on a reconstructed key (shared + unshared parts).
pub const MAX_KEY_SIZE: usize = 64 * 1024;

// Fixed per-entry header: shared (2) + unshared (2) + value_len (4) +
// kind (1) + seq (8).
const ENTRY_HEADER_SIZE: usize = 17;

/// One record decoded out of a block.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockEntry {
    pub key: Bytes,
    pub kind: ValueKind,
    pub seq: u64,
    pub value: Bytes,
}

/// Rejects delta-encoding fields that would read outside the block or blow
/// up the reconstructed key. `current_key` is the previously decoded key,
/// `None` at a restart boundary or block start.
pub(crate) fn validate_delta_encoding(
    shared: usize,
    unshared: usize,
    current_key: Option<&[u8]>,
    remaining: usize,
) -> Result<()> {
    if shared > 0 {
        let current = current_key.ok_or_else(|| {
            Error::CorruptRecord("shared prefix with no previous key".into())
        })?;
        if shared > current.len() {
            return Err(Error::CorruptRecord(format!(
                "shared length {} exceeds previous key length {}",
                shared,
                current.len()
            )));
        }
    }
    if unshared > remaining {
        return Err(Error::CorruptRecord(format!(
            "unshared length {} exceeds remaining block bytes {}",
            unshared, remaining
        )));
    }
    let total = shared
        .checked_add(unshared)
        .ok_or_else(|| Error::CorruptRecord("key length overflow".into()))?;
    if total > MAX_KEY_SIZE {
        return Err(Error::CorruptRecord(format!(
            "reconstructed key length {} exceeds {} byte ceiling",
            total, MAX_KEY_SIZE
        )));
    }
    Ok(())
}

/// Accumulates prefix-compressed records for one data block.
///
/// A restart point (an entry written with `shared = 0`) is emitted every
/// `restart_interval` entries; the offsets of all restart points plus their
/// count trail the entry data so readers can binary-search the block.
pub struct BlockBuilder {
    buf: BytesMut,
    restarts: Vec<u32>,
    restart_interval: usize,
    counter: usize,
    first_key: Option<Bytes>,
    last_key: Bytes,
    entries: usize,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> BlockBuilder {
        BlockBuilder {
            buf: BytesMut::new(),
            restarts: Vec::new(),
            restart_interval: restart_interval.max(1),
            counter: 0,
            first_key: None,
            last_key: Bytes::new(),
            entries: 0,
        }
    }

    pub fn add(&mut self, key: &[u8], kind: ValueKind, seq: u64, value: &[u8]) {
        let shared = if self.counter == 0 {
            self.restarts.push(self.buf.len() as u32);
            0
        } else {
            shared_prefix_len(&self.last_key, key)
        };
        let unshared = key.len() - shared;

        self.buf.put_u16_le(shared as u16);
        self.buf.put_u16_le(unshared as u16);
        self.buf.put_u32_le(value.len() as u32);
        self.buf.put_u8(kind as u8);
        self.buf.put_u64_le(seq);
        self.buf.put_slice(&key[shared..]);
        self.buf.put_slice(value);

        if self.first_key.is_none() {
            self.first_key = Some(Bytes::copy_from_slice(key));
        }
        self.last_key = Bytes::copy_from_slice(key);
        self.entries += 1;
        self.counter += 1;
        if self.counter >= self.restart_interval {
            self.counter = 0;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn first_key(&self) -> Option<&Bytes> {
        self.first_key.as_ref()
    }

    /// Size the block would occupy on disk right now.
    pub fn size_estimate(&self) -> usize {
        self.buf.len() + self.restarts.len() * 4 + 4
    }

    pub fn finish(mut self) -> Bytes {
        for r in &self.restarts {
            self.buf.put_u32_le(*r);
        }
        self.buf.put_u32_le(self.restarts.len() as u32);
        self.buf.freeze()
    }
}

fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    let mut n = 0;
    let limit = a.len().min(b.len()).min(u16::MAX as usize);
    while n < limit && a[n] == b[n] {
        n += 1;
    }
    n
}

/// A decoded data block: the raw entry area plus its restart array.
pub struct Block {
    data: Bytes,
    restarts: Vec<u32>,
}

impl Block {
    pub fn decode(raw: Bytes) -> Result<Block> {
        if raw.len() < 4 {
            return Err(Error::CorruptRecord("block shorter than trailer".into()));
        }
        let count =
            u32::from_le_bytes(raw[raw.len() - 4..].try_into().unwrap()) as usize;
        let restart_bytes = count
            .checked_mul(4)
            .and_then(|n| n.checked_add(4))
            .ok_or_else(|| Error::CorruptRecord("restart count overflow".into()))?;
        if restart_bytes > raw.len() {
            return Err(Error::CorruptRecord(format!(
                "restart array ({} entries) larger than block",
                count
            )));
        }
        let data_len = raw.len() - restart_bytes;
        let mut restarts = Vec::with_capacity(count);
        let mut area = &raw[data_len..raw.len() - 4];
        for _ in 0..count {
            let off = area.get_u32_le();
            if off as usize > data_len {
                return Err(Error::CorruptRecord(
                    "restart offset outside entry area".into(),
                ));
            }
            if let Some(&prev) = restarts.last() {
                if off < prev {
                    return Err(Error::CorruptRecord(
                        "restart offsets not ascending".into(),
                    ));
                }
            }
            restarts.push(off);
        }
        Ok(Block {
            data: raw.slice(..data_len),
            restarts,
        })
    }

    pub fn restart_count(&self) -> usize {
        self.restarts.len()
    }

    /// Decodes the entry at `pos`. `prev_key` must be the key of the entry
    /// decoded immediately before, or `None` at a restart point. Returns the
    /// entry and the offset of the next one.
    pub(crate) fn decode_entry(
        &self,
        pos: usize,
        prev_key: Option<&[u8]>,
    ) -> Result<(BlockEntry, usize)> {
        if pos + ENTRY_HEADER_SIZE > self.data.len() {
            return Err(Error::CorruptRecord("entry header past block end".into()));
        }
        let mut hdr = &self.data[pos..pos + ENTRY_HEADER_SIZE];
        let shared = hdr.get_u16_le() as usize;
        let unshared = hdr.get_u16_le() as usize;
        let value_len = hdr.get_u32_le() as usize;
        let kind_byte = hdr.get_u8();
        let seq = hdr.get_u64_le();

        let body = pos + ENTRY_HEADER_SIZE;
        let remaining = self.data.len() - body;
        validate_delta_encoding(shared, unshared, prev_key, remaining)?;
        if value_len > remaining - unshared {
            return Err(Error::CorruptRecord(format!(
                "value length {} exceeds remaining block bytes",
                value_len
            )));
        }
        let kind = ValueKind::from_u8(kind_byte)
            .ok_or_else(|| Error::CorruptRecord(format!("unknown kind byte {}", kind_byte)))?;

        let mut key = BytesMut::with_capacity(shared + unshared);
        if shared > 0 {
            // validate_delta_encoding proved prev_key covers the prefix.
            key.put_slice(&prev_key.unwrap()[..shared]);
        }
        key.put_slice(&self.data[body..body + unshared]);
        let value = self.data.slice(body + unshared..body + unshared + value_len);

        Ok((
            BlockEntry {
                key: key.freeze(),
                kind,
                seq,
                value,
            },
            body + unshared + value_len,
        ))
    }

    pub(crate) fn entry_area_len(&self) -> usize {
        self.data.len()
    }

    /// Offset of the latest restart point whose key is <= `user_key`, found
    /// by binary search over the restart array. Returns `None` when even the
    /// first restart key is greater.
    pub(crate) fn seek_restart(&self, user_key: &[u8]) -> Result<Option<usize>> {
        if self.restarts.is_empty() {
            return Ok(None);
        }
        let mut lo = 0usize;
        let mut hi = self.restarts.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let (entry, _) = self.decode_entry(self.restarts[mid] as usize, None)?;
            if entry.key.as_ref() <= user_key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == 0 {
            Ok(None)
        } else {
            Ok(Some(self.restarts[lo - 1] as usize))
        }
    }

    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter {
            block: self,
            pos: 0,
            prev_key: None,
        }
    }
}

/// Sequential cursor over one block's entries.
pub struct BlockIter<'a> {
    block: &'a Block,
    pos: usize,
    prev_key: Option<Bytes>,
}

impl<'a> BlockIter<'a> {
    pub fn next_entry(&mut self) -> Result<Option<BlockEntry>> {
        if self.pos >= self.block.entry_area_len() {
            return Ok(None);
        }
        let (entry, next) = self
            .block
            .decode_entry(self.pos, self.prev_key.as_deref())?;
        self.pos = next;
        self.prev_key = Some(entry.key.clone());
        Ok(Some(entry))
    }

    /// Repositions at the first entry whose user key is >= `user_key`.
    pub fn seek(&mut self, user_key: &[u8]) -> Result<()> {
        match self.block.seek_restart(user_key)? {
            Some(pos) => {
                self.pos = pos;
                self.prev_key = None;
            }
            None => {
                self.pos = 0;
                self.prev_key = None;
                return Ok(());
            }
        }
        // Walk forward to the first entry at or past the target, then back
        // the cursor up so the next call yields it.
        loop {
            let mark_pos = self.pos;
            let mark_prev = self.prev_key.clone();
            match self.next_entry()? {
                Some(e) if e.key.as_ref() < user_key => continue,
                Some(_) => {
                    self.pos = mark_pos;
                    self.prev_key = mark_prev;
                    return Ok(());
                }
                None => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn build_block(rows: &[(&str, &str, u64)]) -> Block {
        let mut b = BlockBuilder::new(4);
        for (k, v, s) in rows {
            b.add(k.as_bytes(), ValueKind::Put, *s, v.as_bytes());
        }
        Block::decode(b.finish()).unwrap()
    }

    #[test]
    fn test_roundtrip_with_restarts() {
        let rows: Vec<(String, String, u64)> = (0..30)
            .map(|i| (format!("key:{:04}", i), format!("value:{}", i), i as u64))
            .collect();
        let mut builder = BlockBuilder::new(4);
        for (k, v, s) in &rows {
            builder.add(k.as_bytes(), ValueKind::Put, *s, v.as_bytes());
        }
        assert_eq!(builder.entries(), 30);
        let block = Block::decode(builder.finish()).unwrap();
        // 30 entries at interval 4 -> ceil(30/4) restart points.
        assert_eq!(block.restart_count(), 8);

        let mut it = block.iter();
        for (k, v, s) in &rows {
            let e = it.next_entry().unwrap().expect("entry missing");
            assert_eq!(e.key, k.as_bytes());
            assert_eq!(e.value, v.as_bytes());
            assert_eq!(e.seq, *s);
            assert_eq!(e.kind, ValueKind::Put);
        }
        assert!(it.next_entry().unwrap().is_none());
    }

    #[test]
    fn test_tombstones_and_empty_values() {
        let mut b = BlockBuilder::new(16);
        b.add(b"alive", ValueKind::Put, 2, b"v");
        b.add(b"dead", ValueKind::Delete, 3, b"");
        b.add(b"empty", ValueKind::Put, 4, b"");
        let block = Block::decode(b.finish()).unwrap();
        let mut it = block.iter();

        let e = it.next_entry().unwrap().unwrap();
        assert_eq!(e.kind, ValueKind::Put);
        let e = it.next_entry().unwrap().unwrap();
        assert_eq!(e.kind, ValueKind::Delete);
        assert!(e.value.is_empty());
        let e = it.next_entry().unwrap().unwrap();
        assert_eq!(e.kind, ValueKind::Put);
        assert!(e.value.is_empty());
    }

    #[test]
    fn test_prefix_compression_shrinks_output() {
        let mut compressed = BlockBuilder::new(16);
        let mut uncompressed_len = 0;
        for i in 0..16 {
            let key = format!("common/long/prefix/key-{:02}", i);
            uncompressed_len += key.len();
            compressed.add(key.as_bytes(), ValueKind::Put, i as u64, b"v");
        }
        // All but the restart entry share a long prefix.
        assert!(compressed.size_estimate() < uncompressed_len + 16 * (ENTRY_HEADER_SIZE + 1) );
        let block = Block::decode(compressed.finish()).unwrap();
        let mut it = block.iter();
        for i in 0..16 {
            let e = it.next_entry().unwrap().unwrap();
            assert_eq!(e.key, format!("common/long/prefix/key-{:02}", i).as_bytes());
        }
    }

    #[test]
    fn test_seek() {
        let block = build_block(&[
            ("apple", "1", 1),
            ("banana", "2", 2),
            ("cherry", "3", 3),
            ("date", "4", 4),
            ("fig", "5", 5),
        ]);

        let mut it = block.iter();
        it.seek(b"cherry").unwrap();
        assert_eq!(it.next_entry().unwrap().unwrap().key, "cherry".as_bytes());

        let mut it = block.iter();
        it.seek(b"coconut").unwrap();
        assert_eq!(it.next_entry().unwrap().unwrap().key, "date".as_bytes());

        let mut it = block.iter();
        it.seek(b"a").unwrap();
        assert_eq!(it.next_entry().unwrap().unwrap().key, "apple".as_bytes());

        let mut it = block.iter();
        it.seek(b"zzz").unwrap();
        assert!(it.next_entry().unwrap().is_none());
    }

    #[test]
    fn test_validate_shared_exceeds_previous() {
        assert!(validate_delta_encoding(5, 2, Some(b"abc"), 100).is_err());
    }

    #[test]
    fn test_validate_shared_without_previous() {
        assert!(validate_delta_encoding(1, 2, None, 100).is_err());
    }

    #[test]
    fn test_validate_unshared_exceeds_remaining() {
        assert!(validate_delta_encoding(2, 5, Some(b"abc"), 2).is_err());
    }

    #[test]
    fn test_validate_key_ceiling() {
        let big = vec![0u8; 40_000];
        // 40k shared + 40k unshared = 80k, over the 64 KiB ceiling.
        assert!(validate_delta_encoding(40_000, 40_000, Some(&big), 80_000).is_err());
        // Exactly at the ceiling passes.
        let max = vec![0u8; 32 * 1024];
        validate_delta_encoding(32 * 1024, 32 * 1024, Some(&max), 64 * 1024).unwrap();
        // One past the ceiling fails.
        assert!(validate_delta_encoding(32 * 1024, 32 * 1024 + 1, Some(&max), 80_000).is_err());
    }

    #[test]
    fn test_validate_zero_shared_ok() {
        validate_delta_encoding(0, 3, None, 10).unwrap();
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Block::decode(Bytes::from_static(&[1, 2])).is_err());
        // Count claims more restarts than the block holds.
        let mut raw = BytesMut::new();
        raw.put_u32_le(1000);
        assert!(Block::decode(raw.freeze()).is_err());
    }

    #[test]
    fn test_corrupt_entry_header_rejected() {
        let mut b = BlockBuilder::new(16);
        b.add(b"k", ValueKind::Put, 1, b"v");
        let finished = b.finish();
        let mut raw = BytesMut::from(finished.as_ref());
        // Inflate the unshared length beyond the block.
        raw[2] = 0xff;
        raw[3] = 0xff;
        let block = Block::decode(raw.freeze()).unwrap();
        assert!(block.iter().next_entry().is_err());
    }

    #[test]
    fn test_unknown_kind_byte_rejected() {
        let mut b = BlockBuilder::new(16);
        b.add(b"k", ValueKind::Put, 1, b"v");
        let finished = b.finish();
        let mut raw = BytesMut::from(finished.as_ref());
        // Kind byte sits after shared/unshared/value_len.
        raw[8] = 99;
        let block = Block::decode(raw.freeze()).unwrap();
        assert!(block.iter().next_entry().is_err());
    }
}
