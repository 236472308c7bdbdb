use crate::filter::MAX_FILTER_SIZE;
use crate::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};

/// "STRATSS1" in little-endian byte order.
pub const FOOTER_MAGIC: u64 = 0x3153_5354_4152_5453;

pub const CURRENT_VERSION: u32 = 1;

/// magic (8) + version (4) + index_offset (8) + index_size (8) +
/// num_entries (8) + bloom_offset (8) + bloom_size (8) + checksum (4).
pub const FOOTER_SIZE: usize = 56;

/// Fixed-size trailer of every table file. A zero `bloom_offset` means the
/// file carries no filter.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Footer {
    pub version: u32,
    pub index_offset: u64,
    pub index_size: u64,
    pub num_entries: u64,
    pub bloom_offset: u64,
    pub bloom_size: u64,
}

impl Footer {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FOOTER_SIZE);
        buf.put_u64_le(FOOTER_MAGIC);
        buf.put_u32_le(self.version);
        buf.put_u64_le(self.index_offset);
        buf.put_u64_le(self.index_size);
        buf.put_u64_le(self.num_entries);
        buf.put_u64_le(self.bloom_offset);
        buf.put_u64_le(self.bloom_size);
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Footer> {
        if data.len() != FOOTER_SIZE {
            return Err(Error::InvalidTable(format!(
                "footer must be {} bytes, got {}",
                FOOTER_SIZE,
                data.len()
            )));
        }
        let expected = u32::from_le_bytes(data[FOOTER_SIZE - 4..].try_into().unwrap());
        if crc32fast::hash(&data[..FOOTER_SIZE - 4]) != expected {
            return Err(Error::InvalidTable("footer checksum mismatch".into()));
        }

        let mut buf = &data[..FOOTER_SIZE - 4];
        let magic = buf.get_u64_le();
        if magic != FOOTER_MAGIC {
            return Err(Error::InvalidTable(format!(
                "bad magic: {:#018x}",
                magic
            )));
        }
        let version = buf.get_u32_le();
        if version != CURRENT_VERSION {
            return Err(Error::InvalidTable(format!(
                "unsupported format version {}",
                version
            )));
        }
        Ok(Footer {
            version,
            index_offset: buf.get_u64_le(),
            index_size: buf.get_u64_le(),
            num_entries: buf.get_u64_le(),
            bloom_offset: buf.get_u64_le(),
            bloom_size: buf.get_u64_le(),
        })
    }

    /// Structural validation against the real file size, run before any
    /// region is read. All arithmetic is overflow-checked so a malicious
    /// footer cannot wrap a bounds check.
    pub fn validate(&self, file_size: u64) -> Result<()> {
        let overflow = || Error::InvalidTable("field arithmetic overflow".into());

        if self.num_entries == 0 {
            return Err(Error::InvalidTable("table has no entries".into()));
        }
        if self.index_size == 0 {
            return Err(Error::InvalidTable("index size is zero".into()));
        }
        let data_limit = file_size
            .checked_sub(FOOTER_SIZE as u64)
            .ok_or_else(|| Error::InvalidTable("file smaller than footer".into()))?;

        let index_end = self
            .index_offset
            .checked_add(self.index_size)
            .ok_or_else(overflow)?;
        if index_end > data_limit {
            return Err(Error::InvalidTable(format!(
                "index [{}, {}) reaches past data region end {}",
                self.index_offset, index_end, data_limit
            )));
        }

        if self.bloom_offset != 0 {
            if self.bloom_size == 0 {
                return Err(Error::InvalidTable(
                    "bloom filter offset set but size is zero".into(),
                ));
            }
            if self.bloom_size > MAX_FILTER_SIZE.min(file_size) {
                return Err(Error::InvalidTable(format!(
                    "bloom filter size {} exceeds limit",
                    self.bloom_size
                )));
            }
            let bloom_end = self
                .bloom_offset
                .checked_add(self.bloom_size)
                .ok_or_else(overflow)?;
            if bloom_end > data_limit {
                return Err(Error::InvalidTable(format!(
                    "bloom filter [{}, {}) reaches past data region end {}",
                    self.bloom_offset, bloom_end, data_limit
                )));
            }
            // The filter may not overlap the index.
            if self.bloom_offset < index_end && self.index_offset < bloom_end {
                return Err(Error::InvalidTable(
                    "bloom filter overlaps index".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn valid_footer() -> Footer {
        Footer {
            version: CURRENT_VERSION,
            index_offset: 100,
            index_size: 200,
            num_entries: 10,
            bloom_offset: 0,
            bloom_size: 0,
        }
    }

    #[test]
    fn test_roundtrip() {
        let f = Footer {
            version: CURRENT_VERSION,
            index_offset: 4096,
            index_size: 512,
            num_entries: 77,
            bloom_offset: 4608,
            bloom_size: 64,
        };
        let buf = f.encode();
        assert_eq!(buf.len(), FOOTER_SIZE);
        assert_eq!(Footer::decode(&buf).unwrap(), f);
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = valid_footer().encode();
        buf[0] ^= 0xff;
        // Fix the checksum so only the magic is wrong.
        let crc = crc32fast::hash(&buf[..FOOTER_SIZE - 4]);
        buf[FOOTER_SIZE - 4..].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(Footer::decode(&buf), Err(Error::InvalidTable(_))));
    }

    #[test]
    fn test_bad_version() {
        let mut buf = valid_footer().encode();
        buf[8] = 99;
        let crc = crc32fast::hash(&buf[..FOOTER_SIZE - 4]);
        buf[FOOTER_SIZE - 4..].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(Footer::decode(&buf), Err(Error::InvalidTable(_))));
    }

    #[test]
    fn test_corrupt_checksum() {
        let mut buf = valid_footer().encode();
        buf[20] ^= 0xff;
        assert!(matches!(Footer::decode(&buf), Err(Error::InvalidTable(_))));
    }

    #[test]
    fn test_wrong_length() {
        assert!(Footer::decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_validate_accepts_valid() {
        valid_footer().validate(1000).unwrap();
    }

    #[test]
    fn test_validate_zero_entries() {
        let f = Footer {
            num_entries: 0,
            ..valid_footer()
        };
        assert!(f.validate(1000).is_err());
    }

    #[test]
    fn test_validate_zero_index_size() {
        let f = Footer {
            index_size: 0,
            ..valid_footer()
        };
        assert!(f.validate(1000).is_err());
    }

    #[test]
    fn test_validate_index_beyond_file() {
        let f = Footer {
            index_offset: 10_000,
            index_size: 100,
            ..valid_footer()
        };
        assert!(f.validate(1000).is_err());
    }

    #[test]
    fn test_validate_index_one_byte_past_limit() {
        let file_size = 1000u64;
        let limit = file_size - FOOTER_SIZE as u64;
        let ok = Footer {
            index_offset: limit - 50,
            index_size: 50,
            ..valid_footer()
        };
        ok.validate(file_size).unwrap();
        let bad = Footer {
            index_offset: limit - 50,
            index_size: 51,
            ..valid_footer()
        };
        assert!(bad.validate(file_size).is_err());
    }

    #[test]
    fn test_validate_index_overlaps_footer() {
        let file_size = 1000u64;
        let footer_start = file_size - FOOTER_SIZE as u64;
        let f = Footer {
            index_offset: footer_start - 10,
            index_size: 50,
            ..valid_footer()
        };
        assert!(f.validate(file_size).is_err());
    }

    #[test]
    fn test_validate_bloom_beyond_file() {
        let f = Footer {
            bloom_offset: 10_000,
            bloom_size: 100,
            ..valid_footer()
        };
        assert!(f.validate(1000).is_err());
    }

    #[test]
    fn test_validate_bloom_zero_size_with_offset() {
        let f = Footer {
            bloom_offset: 500,
            bloom_size: 0,
            ..valid_footer()
        };
        assert!(f.validate(1000).is_err());
    }

    #[test]
    fn test_validate_bloom_oversized() {
        let f = Footer {
            bloom_offset: 500,
            bloom_size: 128 * 1024 * 1024,
            ..valid_footer()
        };
        assert!(f.validate(1000).is_err());
    }

    #[test]
    fn test_validate_bloom_overlaps_index() {
        let f = Footer {
            index_offset: 100,
            index_size: 200,
            bloom_offset: 250,
            bloom_size: 100,
            ..valid_footer()
        };
        assert!(f.validate(1000).is_err());
    }

    #[test]
    fn test_validate_overflowing_fields() {
        let f = Footer {
            index_offset: u64::MAX - 10,
            index_size: 100,
            ..valid_footer()
        };
        assert!(f.validate(1000).is_err());

        let f = Footer {
            bloom_offset: u64::MAX - 10,
            bloom_size: 100,
            ..valid_footer()
        };
        assert!(f.validate(1000).is_err());
    }
}
