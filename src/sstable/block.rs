//! A single SSTable data block and its iterator.
//!
//! ## Block Layout
//!
//! ```text
//! +--------------------+
//! | Entry 1            |
//! +--------------------+
//! | ...                |
//! +--------------------+
//! | Entry N            |
//! +--------------------+
//! | Entry offsets      |  u32 LE per entry, relative to block start
//! +--------------------+
//! | Offset count (u32) |
//! +--------------------+
//! | Checksum record    |
//! +--------------------+
//! | Checksum len (u32) |
//! +--------------------+
//! ```
//!
//! Keys are prefix-compressed against the block's first key (the base key).
//! Each entry is `u16 overlap ‖ u16 diff_len ‖ diff_bytes ‖ encoded value`,
//! all little-endian; the first entry stores its key in full.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::checksum;
use crate::entry::{Entry, ValueStruct};
use crate::error::{corruption, Error, Result};
use crate::key::{compare_keys, parse_ts};

/// Serialized size of an entry header.
pub const HEADER_SIZE: usize = 4;

/// Prefix-compression header preceding every entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHeader {
    /// Number of leading bytes shared with the block's base key.
    pub overlap: u16,
    /// Length of the diff that follows.
    pub diff: u16,
}

impl BlockHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        LittleEndian::write_u16(&mut buf[..2], self.overlap);
        LittleEndian::write_u16(&mut buf[2..], self.diff);
        buf
    }

    pub fn decode(buf: &[u8]) -> Self {
        Self {
            overlap: LittleEndian::read_u16(&buf[..2]),
            diff: LittleEndian::read_u16(&buf[2..4]),
        }
    }
}

/// A decoded, checksum-verified data block.
pub struct Block {
    /// Entry bytes only; the trailing offset array and checksum have been
    /// parsed off.
    data: Vec<u8>,
    entry_offsets: Vec<u32>,
}

impl Block {
    /// Parses a serialized block, verifying its checksum. Corruption is
    /// surfaced here, before any entry can be materialized.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let mut read_end = raw.len();
        if read_end < 4 {
            return Err(corruption!("block of {read_end} bytes has no footer"));
        }

        read_end -= 4;
        let checksum_len = LittleEndian::read_u32(&raw[read_end..]) as usize;
        if checksum_len > read_end {
            return Err(corruption!("block checksum length {checksum_len} out of range"));
        }
        read_end -= checksum_len;
        let stored_checksum = &raw[read_end..read_end + checksum_len];
        checksum::verify(&raw[..read_end], stored_checksum)?;

        if read_end < 4 {
            return Err(corruption!("block too short for entry count"));
        }
        read_end -= 4;
        let count = LittleEndian::read_u32(&raw[read_end..read_end + 4]) as usize;
        if count == 0 || count * 4 > read_end {
            return Err(corruption!("block entry count {count} out of range"));
        }

        read_end -= count * 4;
        let entries_index_start = read_end;
        let mut entry_offsets = Vec::with_capacity(count);
        for i in 0..count {
            let at = entries_index_start + i * 4;
            entry_offsets.push(LittleEndian::read_u32(&raw[at..at + 4]));
        }
        if entry_offsets[0] != 0 {
            return Err(corruption!("first entry offset is {}", entry_offsets[0]));
        }
        for window in entry_offsets.windows(2) {
            if window[0] >= window[1] {
                return Err(corruption!("entry offsets are not strictly increasing"));
            }
        }
        if let Some(&last) = entry_offsets.last() {
            if last as usize >= entries_index_start {
                return Err(corruption!("entry offset {last} out of range"));
            }
        }

        Ok(Self {
            data: raw[..entries_index_start].to_vec(),
            entry_offsets,
        })
    }

    pub fn entry_count(&self) -> usize {
        self.entry_offsets.len()
    }

    pub fn iter(self: Arc<Self>) -> BlockIterator {
        BlockIterator::new(self)
    }
}

/// Forward/seek cursor over one block.
///
/// Keys are rebuilt incrementally: when the next entry shares more of the
/// base key than the previous one did, only the missing base-key bytes are
/// copied in, then the diff is appended. This keeps forward iteration from
/// re-copying the whole key at every step.
pub struct BlockIterator {
    block: Arc<Block>,
    idx: usize,
    valid: bool,
    err: Option<Error>,

    base_key: Vec<u8>,
    key: Vec<u8>,
    val: ValueStruct,
    /// The previous entry's overlap; drives incremental key rebuilds.
    prev_overlap: u16,
}

impl BlockIterator {
    fn new(block: Arc<Block>) -> Self {
        Self {
            block,
            idx: 0,
            valid: false,
            err: None,
            base_key: Vec::new(),
            key: Vec::new(),
            val: ValueStruct::default(),
            prev_overlap: 0,
        }
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// The current entry's full key (version tag included).
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &ValueStruct {
        &self.val
    }

    /// The current position materialized as an entry.
    pub fn entry(&self) -> Entry {
        Entry {
            key: self.key.clone(),
            value: self.val.value.clone(),
            expires_at: self.val.expires_at,
            meta: self.val.meta,
            version: self.val.version,
        }
    }

    pub fn seek_to_first(&mut self) {
        self.set_idx(0);
    }

    pub fn seek_to_last(&mut self) {
        self.set_idx(self.block.entry_offsets.len().wrapping_sub(1));
    }

    pub fn next(&mut self) {
        self.set_idx(self.idx + 1);
    }

    /// Positions at the first entry with key >= `key` in prefix-then-
    /// descending-version order. Invalid when no such entry exists.
    pub fn seek(&mut self, key: &[u8]) {
        let mut lo = 0;
        let mut hi = self.block.entry_offsets.len();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            self.set_idx(mid);
            if self.err.is_some() {
                return;
            }
            if compare_keys(&self.key, key).is_lt() {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        self.set_idx(lo);
    }

    /// Materializes entry `i`, rebuilding the cached key buffer.
    pub fn set_idx(&mut self, i: usize) {
        if i >= self.block.entry_offsets.len() {
            self.valid = false;
            return;
        }
        self.idx = i;

        if self.base_key.is_empty() {
            // The first entry always stores its key whole.
            if self.block.data.len() < HEADER_SIZE {
                self.fail(corruption!("block data shorter than one header"));
                return;
            }
            let base_header = BlockHeader::decode(&self.block.data);
            let end = HEADER_SIZE + base_header.diff as usize;
            if base_header.overlap != 0 || end > self.block.data.len() {
                self.fail(corruption!("malformed base entry header"));
                return;
            }
            self.base_key = self.block.data[HEADER_SIZE..end].to_vec();
        }

        let start = self.block.entry_offsets[i] as usize;
        let end = match self.block.entry_offsets.get(i + 1) {
            Some(&next) => next as usize,
            None => self.block.data.len(),
        };
        let entry_data = &self.block.data[start..end];
        if entry_data.len() < HEADER_SIZE {
            self.fail(corruption!("entry {i} shorter than its header"));
            return;
        }

        let header = BlockHeader::decode(entry_data);
        let diff_end = HEADER_SIZE + header.diff as usize;
        if header.overlap as usize > self.base_key.len() || diff_end + 2 > entry_data.len() {
            self.fail(corruption!("entry {i} header out of bounds"));
            return;
        }

        // Extend the cached key with base-key bytes the previous entry did
        // not share, then splice on this entry's diff.
        if header.overlap > self.prev_overlap {
            self.key.truncate(self.prev_overlap as usize);
            self.key
                .extend_from_slice(&self.base_key[self.prev_overlap as usize..header.overlap as usize]);
        }
        self.prev_overlap = header.overlap;
        self.key.truncate(header.overlap as usize);
        self.key.extend_from_slice(&entry_data[HEADER_SIZE..diff_end]);

        self.val = ValueStruct::decode(&entry_data[diff_end..]);
        self.val.version = parse_ts(&self.key);
        self.err = None;
        self.valid = true;
    }

    fn fail(&mut self, err: Error) {
        self.err = Some(err);
        self.valid = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::sstable::builder::Builder;

    /// Serializes entries through the builder and hands back the lone
    /// block's bytes.
    fn build_single_block(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = Builder::new(Config::default());
        for (k, v) in entries {
            builder.add_key(&Entry::new(*k, *v));
        }
        let data = builder.done();
        assert_eq!(data.block_count(), 1);
        data.block_bytes(0).to_vec()
    }

    #[test]
    fn test_header_encode() {
        let header = BlockHeader {
            overlap: 257,
            diff: 4,
        };
        assert_eq!(header.encode(), [0x01, 0x01, 0x04, 0x00]);
        assert_eq!(BlockHeader::decode(&[0x01, 0x01, 0x04, 0x00]), header);
    }

    #[test]
    fn test_block_roundtrip() {
        let entries = [
            ("apple", "fruit"),
            ("application", "software"),
            ("banana", "fruit"),
            ("band", "music"),
            ("bandana", "clothing"),
        ];
        let raw = build_single_block(&entries);
        let block = Arc::new(Block::decode(&raw).expect("decode failed"));
        assert_eq!(block.entry_count(), 5);

        let mut iter = block.iter();
        iter.seek_to_first();
        for (k, v) in entries {
            assert!(iter.valid());
            assert_eq!(iter.key(), k.as_bytes());
            assert_eq!(iter.value().value, v.as_bytes());
            iter.next();
        }
        assert!(!iter.valid());
    }

    #[test]
    fn test_iterator_seek() {
        let entries = [
            ("apple", "fruit"),
            ("application", "software"),
            ("banana", "fruit"),
            ("band", "music"),
            ("bandana", "clothing"),
        ];
        let raw = build_single_block(&entries);
        let block = Arc::new(Block::decode(&raw).unwrap());

        let mut iter = Arc::clone(&block).iter();
        iter.seek(b"band");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"band");

        // Between keys: lands on the next greater one.
        iter.seek(b"bana");
        assert_eq!(iter.key(), b"banana");

        iter.seek(b"zzz");
        assert!(!iter.valid());

        iter.seek(b"a");
        assert_eq!(iter.key(), b"apple");

        iter.seek_to_last();
        assert_eq!(iter.key(), b"bandana");
    }

    #[test]
    fn test_single_byte_corruption_detected() {
        let entries = [("alpha", "one"), ("alps", "two"), ("beta", "three")];
        let raw = build_single_block(&entries);

        // Flipping any byte of the entry area must fail the checksum.
        for i in 0..raw.len() - 16 {
            let mut tampered = raw.clone();
            tampered[i] ^= 0x01;
            assert!(
                Block::decode(&tampered).is_err(),
                "corruption at byte {i} went undetected"
            );
        }
    }

    #[test]
    fn test_truncated_block() {
        let raw = build_single_block(&[("k", "v")]);
        assert!(Block::decode(&raw[..2]).is_err());
        assert!(Block::decode(&[]).is_err());
    }

    #[test]
    fn test_prefix_compression_overlaps() {
        let entries = [("prefix-a", "1"), ("prefix-b", "2"), ("prefix-c", "3")];
        let raw = build_single_block(&entries);

        // The base entry has no overlap; the others share "prefix-".
        let first = BlockHeader::decode(&raw);
        assert_eq!(first.overlap, 0);
        assert_eq!(first.diff as usize, "prefix-a".len());

        let block = Arc::new(Block::decode(&raw).unwrap());
        let mut iter = block.iter();
        iter.seek_to_first();
        let mut keys = Vec::new();
        while iter.valid() {
            keys.push(iter.key().to_vec());
            iter.next();
        }
        assert_eq!(keys, vec![b"prefix-a", b"prefix-b", b"prefix-c"]);
    }
}
