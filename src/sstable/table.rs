//! Read-side SSTable and the writable-region abstraction the builder
//! flushes through.
//!
//! ## Table File Layout
//!
//! ```text
//! +--------------------+
//! | Block 1            |
//! +--------------------+
//! | ...                |
//! +--------------------+
//! | Block N            |
//! +--------------------+
//! | Index record       |
//! +--------------------+
//! | Index len (u32)    |
//! +--------------------+
//! | Index checksum     |
//! +--------------------+
//! | Checksum len (u32) |
//! +--------------------+
//! ```

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::bloom::Filter;
use crate::checksum;
use crate::entry::Entry;
use crate::error::{corruption, Result};
use crate::key::{compare_keys, same_key};

use super::block::{Block, BlockIterator};
use super::index::TableIndex;

/// A destination exposing a writable region of fixed size. The actual file
/// handling (mmap, direct IO, fsync policy) belongs to the caller.
pub trait TableFile {
    /// A mutable view of `len` bytes starting at `offset`.
    fn bytes(&mut self, offset: usize, len: usize) -> Result<&mut [u8]>;
}

/// An in-memory [`TableFile`], for tests and table-shaped buffers.
#[derive(Default)]
pub struct MemFile {
    buf: Vec<u8>,
}

impl MemFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

impl TableFile for MemFile {
    fn bytes(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let end = offset + len;
        if self.buf.len() < end {
            self.buf.resize(end, 0);
        }
        Ok(&mut self.buf[offset..end])
    }
}

/// An immutable table opened from its serialized bytes. The index checksum
/// is verified up front; block checksums are verified as blocks are
/// materialized.
pub struct Table {
    data: Vec<u8>,
    index: TableIndex,
    filter: Filter,
}

impl Table {
    pub fn open(data: Vec<u8>) -> Result<Self> {
        let mut read_end = data.len();
        if read_end < 8 {
            return Err(corruption!("table of {read_end} bytes has no footer"));
        }

        read_end -= 4;
        let checksum_len = LittleEndian::read_u32(&data[read_end..]) as usize;
        if checksum_len > read_end {
            return Err(corruption!("index checksum length {checksum_len} out of range"));
        }
        read_end -= checksum_len;
        let stored_checksum = data[read_end..read_end + checksum_len].to_vec();

        if read_end < 4 {
            return Err(corruption!("table too short for index length"));
        }
        read_end -= 4;
        let index_len = LittleEndian::read_u32(&data[read_end..]) as usize;
        if index_len > read_end {
            return Err(corruption!("index length {index_len} out of range"));
        }
        let index_start = read_end - index_len;
        checksum::verify(&data[index_start..read_end], &stored_checksum)?;

        let index = TableIndex::decode(&data[index_start..read_end])?;
        for bo in &index.offsets {
            let end = bo.offset as usize + bo.len as usize;
            if end > index_start {
                return Err(corruption!("block at {} runs past the index", bo.offset));
            }
        }

        let filter = Filter::from_bytes(index.bloom_filter.clone());
        Ok(Self {
            data,
            index,
            filter,
        })
    }

    pub fn block_count(&self) -> usize {
        self.index.offsets.len()
    }

    /// Decodes block `i`, verifying its checksum.
    pub fn block(&self, i: usize) -> Result<Block> {
        let bo = &self.index.offsets[i];
        let start = bo.offset as usize;
        Block::decode(&self.data[start..start + bo.len as usize])
    }

    /// Whether the table may contain the key, per the bloom filter. Tables
    /// built without a filter always answer yes.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.filter.is_empty() || self.filter.may_contain_key(key)
    }

    pub fn key_count(&self) -> u32 {
        self.index.key_count
    }

    pub fn max_version(&self) -> u64 {
        self.index.max_version
    }

    /// Serialized size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Point lookup: bloom check, index binary search, then a seek inside
    /// the candidate block.
    pub fn search(&self, key: &[u8]) -> Result<Option<Entry>> {
        if !self.may_contain(key) {
            return Ok(None);
        }
        if self.index.offsets.is_empty() {
            return Ok(None);
        }
        // Last block whose base key is <= the target. A target that sorts
        // before every base key (e.g. a max-version probe of the first
        // prefix) still lands in block 0.
        let idx = self
            .index
            .offsets
            .partition_point(|bo| compare_keys(&bo.key, key).is_le());
        let block = Arc::new(self.block(idx.saturating_sub(1))?);
        let mut iter = block.iter();
        iter.seek(key);
        if let Some(err) = iter.error() {
            return Err(err.clone());
        }
        if iter.valid() && same_key(iter.key(), key) {
            return Ok(Some(iter.entry()));
        }
        Ok(None)
    }

    /// Iterates every entry in key order across all blocks.
    pub fn iter(&self) -> TableIterator<'_> {
        TableIterator {
            table: self,
            block_idx: 0,
            current: None,
        }
    }
}

/// Chains the table's blocks into one entry stream.
pub struct TableIterator<'a> {
    table: &'a Table,
    block_idx: usize,
    current: Option<BlockIterator>,
}

impl Iterator for TableIterator<'_> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(iter) = &mut self.current {
                if iter.valid() {
                    let entry = iter.entry();
                    iter.next();
                    return Some(Ok(entry));
                }
                let err = iter.error().cloned();
                self.current = None;
                if let Some(err) = err {
                    return Some(Err(err));
                }
            }

            if self.block_idx >= self.table.block_count() {
                return None;
            }
            match self.table.block(self.block_idx) {
                Ok(block) => {
                    let mut iter = Arc::new(block).iter();
                    iter.seek_to_first();
                    self.current = Some(iter);
                    self.block_idx += 1;
                }
                Err(err) => {
                    self.block_idx += 1;
                    return Some(Err(err));
                }
            }
        }
    }
}
