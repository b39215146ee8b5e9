//! The table index: the versioned record trailing every SSTable.
//!
//! Encoded little-endian as a version byte followed by tagged fields:
//!
//! ```text
//! u8 version (=1)
//! 0x01 ‖ u32 len ‖ bloom filter bytes
//! 0x02 ‖ u32 key count
//! 0x03 ‖ u64 max version
//! 0x04 ‖ u32 count ‖ count * (u16 key_len ‖ key ‖ u32 offset ‖ u32 len)
//! ```
//!
//! Unknown versions or tags are decode errors; readers never guess at a
//! layout they do not understand.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{errdecode, Result};

const INDEX_VERSION: u8 = 1;

const TAG_BLOOM: u8 = 0x01;
const TAG_KEY_COUNT: u8 = 0x02;
const TAG_MAX_VERSION: u8 = 0x03;
const TAG_OFFSETS: u8 = 0x04;

/// Locates one data block inside the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockOffset {
    /// The block's base key, stored in full.
    pub key: Vec<u8>,
    /// Byte offset of the block from the start of the file.
    pub offset: u32,
    /// Serialized length of the block.
    pub len: u32,
}

/// Everything a reader needs before touching any data block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableIndex {
    pub bloom_filter: Vec<u8>,
    pub key_count: u32,
    pub max_version: u64,
    pub offsets: Vec<BlockOffset>,
}

impl TableIndex {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(INDEX_VERSION);

        buf.push(TAG_BLOOM);
        buf.write_u32::<LittleEndian>(self.bloom_filter.len() as u32)
            .expect("vec write");
        buf.extend_from_slice(&self.bloom_filter);

        buf.push(TAG_KEY_COUNT);
        buf.write_u32::<LittleEndian>(self.key_count).expect("vec write");

        buf.push(TAG_MAX_VERSION);
        buf.write_u64::<LittleEndian>(self.max_version)
            .expect("vec write");

        buf.push(TAG_OFFSETS);
        buf.write_u32::<LittleEndian>(self.offsets.len() as u32)
            .expect("vec write");
        for bo in &self.offsets {
            buf.write_u16::<LittleEndian>(bo.key.len() as u16)
                .expect("vec write");
            buf.extend_from_slice(&bo.key);
            buf.write_u32::<LittleEndian>(bo.offset).expect("vec write");
            buf.write_u32::<LittleEndian>(bo.len).expect("vec write");
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);
        let version = cursor
            .read_u8()
            .map_err(|_| errdecode!("index record is empty"))?;
        if version != INDEX_VERSION {
            return Err(errdecode!("unknown index version {version}"));
        }

        let mut index = TableIndex::default();
        while (cursor.position() as usize) < buf.len() {
            let tag = cursor
                .read_u8()
                .map_err(|e| errdecode!("index field tag: {e}"))?;
            match tag {
                TAG_BLOOM => {
                    let len = cursor
                        .read_u32::<LittleEndian>()
                        .map_err(|e| errdecode!("bloom length: {e}"))?
                        as usize;
                    let mut bloom = vec![0u8; len];
                    cursor
                        .read_exact(&mut bloom)
                        .map_err(|e| errdecode!("bloom bytes: {e}"))?;
                    index.bloom_filter = bloom;
                }
                TAG_KEY_COUNT => {
                    index.key_count = cursor
                        .read_u32::<LittleEndian>()
                        .map_err(|e| errdecode!("key count: {e}"))?;
                }
                TAG_MAX_VERSION => {
                    index.max_version = cursor
                        .read_u64::<LittleEndian>()
                        .map_err(|e| errdecode!("max version: {e}"))?;
                }
                TAG_OFFSETS => {
                    let count = cursor
                        .read_u32::<LittleEndian>()
                        .map_err(|e| errdecode!("offset count: {e}"))?
                        as usize;
                    let mut offsets = Vec::with_capacity(count.min(1024));
                    for _ in 0..count {
                        let key_len = cursor
                            .read_u16::<LittleEndian>()
                            .map_err(|e| errdecode!("offset key length: {e}"))?
                            as usize;
                        let mut key = vec![0u8; key_len];
                        cursor
                            .read_exact(&mut key)
                            .map_err(|e| errdecode!("offset key: {e}"))?;
                        let offset = cursor
                            .read_u32::<LittleEndian>()
                            .map_err(|e| errdecode!("block offset: {e}"))?;
                        let len = cursor
                            .read_u32::<LittleEndian>()
                            .map_err(|e| errdecode!("block length: {e}"))?;
                        offsets.push(BlockOffset { key, offset, len });
                    }
                    index.offsets = offsets;
                }
                other => return Err(errdecode!("unknown index field tag {other:#04x}")),
            }
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> TableIndex {
        TableIndex {
            bloom_filter: vec![0xaa, 0xbb, 0x06],
            key_count: 42,
            max_version: 99,
            offsets: vec![
                BlockOffset {
                    key: b"apple".to_vec(),
                    offset: 0,
                    len: 128,
                },
                BlockOffset {
                    key: b"banana".to_vec(),
                    offset: 128,
                    len: 64,
                },
            ],
        }
    }

    #[test]
    fn test_roundtrip() {
        let index = sample_index();
        let encoded = index.encode();
        assert_eq!(TableIndex::decode(&encoded).unwrap(), index);
    }

    #[test]
    fn test_empty_roundtrip() {
        let index = TableIndex::default();
        let decoded = TableIndex::decode(&index.encode()).unwrap();
        assert_eq!(decoded, index);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut encoded = sample_index().encode();
        encoded[0] = 9;
        assert!(TableIndex::decode(&encoded).is_err());
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut encoded = sample_index().encode();
        // The first field tag follows the version byte.
        encoded[1] = 0x7f;
        assert!(TableIndex::decode(&encoded).is_err());
    }

    #[test]
    fn test_truncated_rejected() {
        let encoded = sample_index().encode();
        assert!(TableIndex::decode(&encoded[..encoded.len() - 3]).is_err());
        assert!(TableIndex::decode(&[]).is_err());
    }
}
