//! SSTable builder: serializes an ordered entry stream into prefix-
//! compressed blocks with per-block checksums, a bloom filter and a
//! trailing index.

use byteorder::{ByteOrder, LittleEndian};

use crate::bloom::{self, bloom_bits_per_key, Filter};
use crate::checksum::{self, CHECKSUM_SIZE};
use crate::config::Config;
use crate::entry::{Entry, ValueStruct};
use crate::error::Result;
use crate::key::{parse_key, parse_ts};

use super::block::BlockHeader;
use super::index::{BlockOffset, TableIndex};
use super::table::{Table, TableFile};

/// Per-entry size charged when estimating whether a block is full: the
/// header plus the offset-array slot the entry will occupy.
const ENTRY_OVERHEAD: usize = 6;

/// The block being assembled.
struct BlockBuffer {
    data: Vec<u8>,
    base_key: Vec<u8>,
    entry_offsets: Vec<u32>,
    /// Estimated serialized size, updated as entries are considered.
    estimate: usize,
}

impl BlockBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            base_key: Vec::new(),
            entry_offsets: Vec::new(),
            estimate: 0,
        }
    }
}

/// Accumulates entries (which must arrive in key order) and emits the
/// serialized SSTable. Single-threaded by contract.
pub struct Builder {
    config: Config,
    cur_block: Option<BlockBuffer>,
    block_list: Vec<BlockBuffer>,
    key_hashes: Vec<u32>,
    key_count: u32,
    max_version: u64,
    /// Bytes attributable to stale entries, for compaction decisions.
    stale_data_size: usize,
    /// Running size estimate over finished blocks.
    estimate_sz: usize,
}

impl Builder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            cur_block: None,
            block_list: Vec::new(),
            key_hashes: Vec::new(),
            key_count: 0,
            max_version: 0,
            stale_data_size: 0,
            estimate_sz: 0,
        }
    }

    /// Appends an entry. Keys must be added in ascending order.
    pub fn add_key(&mut self, e: &Entry) {
        self.add(e, false);
    }

    /// Appends an entry that a compaction has already superseded, tracking
    /// the space it wastes.
    pub fn add_stale_key(&mut self, e: &Entry) {
        // Rough estimate of what the entry occupies in the finished table.
        self.stale_data_size += e.key.len() + e.value.len() + 4 /* entry offset */ + 4 /* header */;
        self.add(e, true);
    }

    fn add(&mut self, e: &Entry, is_stale: bool) {
        let key = &e.key;
        let v = ValueStruct::from(e);

        if self.should_finish_block(e) {
            if is_stale {
                // The key lands in the table index as a block boundary.
                self.stale_data_size += key.len() + 4 /* len */ + 4 /* offset */;
            }
            self.finish_block();
            self.cur_block = Some(BlockBuffer::new(self.config.block_size));
        }
        let block = self
            .cur_block
            .get_or_insert_with(|| BlockBuffer::new(self.config.block_size));

        // The bloom filter indexes key prefixes; the version tag would
        // defeat lookups at other versions.
        self.key_hashes.push(bloom::hash(parse_key(key)));
        let version = parse_ts(key);
        if version > self.max_version {
            self.max_version = version;
        }

        let diff_key: &[u8] = if block.base_key.is_empty() {
            block.base_key = key.clone();
            key
        } else {
            let shared = key
                .iter()
                .zip(&block.base_key)
                .take_while(|(a, b)| a == b)
                .count();
            &key[shared..]
        };
        let overlap = key.len() - diff_key.len();
        assert!(overlap <= u16::MAX as usize, "base-key overlap overflows u16");
        assert!(diff_key.len() <= u16::MAX as usize, "key diff overflows u16");

        let header = BlockHeader {
            overlap: overlap as u16,
            diff: diff_key.len() as u16,
        };
        block.entry_offsets.push(block.data.len() as u32);
        block.data.extend_from_slice(&header.encode());
        block.data.extend_from_slice(diff_key);

        let value_start = block.data.len();
        block.data.resize(value_start + v.encoded_size() as usize, 0);
        v.encode(&mut block.data[value_start..]);
    }

    /// Whether appending `e` would push the current block past its target
    /// size. Records the estimate on the block for the running total.
    fn should_finish_block(&mut self, e: &Entry) -> bool {
        let Some(block) = self.cur_block.as_mut() else {
            // No block open yet; start one.
            return true;
        };
        if block.entry_offsets.is_empty() {
            // Oversize entries are allowed: a lone entry grows its block.
            return false;
        }

        let offsets_size = (block.entry_offsets.len() + 1) * 4
            + 4 // offset-array length field
            + CHECKSUM_SIZE // checksum record
            + 4; // checksum length field
        assert!(
            offsets_size < u32::MAX as usize,
            "block offset bookkeeping overflows u32"
        );

        let estimate = block.data.len()
            + ENTRY_OVERHEAD
            + e.key.len()
            + e.encoded_size() as usize
            + offsets_size;
        assert!(
            block.data.len() + estimate < u32::MAX as usize,
            "block size overflows u32"
        );
        block.estimate = estimate;

        estimate > self.config.block_size
    }

    /// Seals the current block: appends the entry-offset array, its length,
    /// and the checksum record.
    fn finish_block(&mut self) {
        let Some(mut block) = self.cur_block.take() else {
            return;
        };
        if block.entry_offsets.is_empty() {
            return;
        }

        let mut tail = vec![0u8; block.entry_offsets.len() * 4 + 4];
        for (i, &offset) in block.entry_offsets.iter().enumerate() {
            LittleEndian::write_u32(&mut tail[i * 4..], offset);
        }
        let count_at = block.entry_offsets.len() * 4;
        LittleEndian::write_u32(&mut tail[count_at..], block.entry_offsets.len() as u32);
        block.data.extend_from_slice(&tail);

        let sum = checksum::calculate(&block.data).encode();
        block.data.extend_from_slice(&sum);
        let mut len_buf = [0u8; 4];
        LittleEndian::write_u32(&mut len_buf, sum.len() as u32);
        block.data.extend_from_slice(&len_buf);

        tracing::debug!(
            entries = block.entry_offsets.len(),
            bytes = block.data.len(),
            "finished block"
        );

        self.estimate_sz += block.estimate;
        self.key_count += block.entry_offsets.len() as u32;
        self.block_list.push(block);
    }

    /// Whether no entries have been added.
    pub fn is_empty(&self) -> bool {
        self.key_hashes.is_empty()
    }

    /// Whether the running size estimate has passed the target table size.
    /// Upstream writers use this as backpressure to cut the table.
    pub fn reached_capacity(&self) -> bool {
        self.estimate_sz > self.config.table_size
    }

    /// Bytes attributable to stale entries added so far.
    pub fn stale_data_size(&self) -> usize {
        self.stale_data_size
    }

    /// Finalizes the table: seals the last block, builds the bloom filter
    /// and index, and returns the pieces ready to be written out.
    pub fn done(mut self) -> BuildData {
        self.finish_block();
        if self.block_list.is_empty() {
            return BuildData::default();
        }

        let mut bloom_bytes = Vec::new();
        if self.config.bloom_false_positive > 0.0 {
            let bits = bloom_bits_per_key(self.key_hashes.len(), self.config.bloom_false_positive);
            bloom_bytes = Filter::new(&self.key_hashes, bits).as_bytes().to_vec();
        }

        let mut offsets = Vec::with_capacity(self.block_list.len());
        let mut start = 0u32;
        for block in &self.block_list {
            offsets.push(BlockOffset {
                key: block.base_key.clone(),
                offset: start,
                len: block.data.len() as u32,
            });
            start += block.data.len() as u32;
        }

        let index = TableIndex {
            bloom_filter: bloom_bytes,
            key_count: self.key_count,
            max_version: self.max_version,
            offsets,
        }
        .encode();
        let index_checksum = checksum::calculate(&index).encode().to_vec();

        let data_size: usize = self.block_list.iter().map(|b| b.data.len()).sum();
        let size = data_size + index.len() + 4 + index_checksum.len() + 4;

        BuildData {
            blocks: self.block_list.into_iter().map(|b| b.data).collect(),
            index,
            checksum: index_checksum,
            size,
        }
    }

    /// Serializes the whole table into a fresh buffer.
    pub fn finish(self) -> Vec<u8> {
        let data = self.done();
        let mut buf = vec![0u8; data.size];
        let written = data.copy_to(&mut buf);
        assert_eq!(written, buf.len(), "table serialization size mismatch");
        buf
    }

    /// Writes the table through the file collaborator and reopens it for
    /// reading.
    pub fn flush<F: TableFile>(self, file: &mut F) -> Result<Table> {
        let data = self.done();
        let dst = file.bytes(0, data.size)?;
        let written = data.copy_to(dst);
        assert_eq!(written, data.size, "table flush size mismatch");
        tracing::info!(bytes = written, "flushed table");
        Table::open(dst.to_vec())
    }
}

/// The finalized pieces of a table, ready to be laid out as
/// `block* ‖ index ‖ u32(len) ‖ checksum ‖ u32(len)`.
#[derive(Default)]
pub struct BuildData {
    blocks: Vec<Vec<u8>>,
    index: Vec<u8>,
    checksum: Vec<u8>,
    pub size: usize,
}

impl BuildData {
    /// Copies the serialized table into `dst`, returning the bytes written.
    pub fn copy_to(&self, dst: &mut [u8]) -> usize {
        let mut written = 0;
        for block in &self.blocks {
            dst[written..written + block.len()].copy_from_slice(block);
            written += block.len();
        }
        dst[written..written + self.index.len()].copy_from_slice(&self.index);
        written += self.index.len();
        LittleEndian::write_u32(&mut dst[written..], self.index.len() as u32);
        written += 4;

        dst[written..written + self.checksum.len()].copy_from_slice(&self.checksum);
        written += self.checksum.len();
        LittleEndian::write_u32(&mut dst[written..], self.checksum.len() as u32);
        written + 4
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_bytes(&self, i: usize) -> &[u8] {
        &self.blocks[i]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> Config {
        Config::default().block_size(64)
    }

    #[test]
    fn test_empty_builder_emits_nothing() {
        let builder = Builder::new(Config::default());
        assert!(builder.is_empty());
        let data = builder.done();
        assert_eq!(data.size, 0);
        assert_eq!(data.block_count(), 0);
    }

    #[test]
    fn test_block_boundary() {
        let mut builder = Builder::new(small_config());
        for i in 0..16 {
            builder.add_key(&Entry::new(format!("k{i:02}"), "v"));
        }
        assert!(!builder.is_empty());

        let data = builder.done();
        assert!(data.block_count() >= 2, "expected at least two blocks");

        // The first block's base key is the first key added.
        let index = TableIndex::decode(&data.index).unwrap();
        assert_eq!(index.offsets[0].key, b"k00");
        assert_eq!(index.key_count, 16);
    }

    #[test]
    fn test_oversize_entry_grows_block() {
        let mut builder = Builder::new(small_config());
        let big = "x".repeat(500);
        builder.add_key(&Entry::new("huge", big.as_str()));
        builder.add_key(&Entry::new("tiny", "v"));

        let data = builder.done();
        // The oversize entry kept its own block; the next entry opened a
        // fresh one.
        assert_eq!(data.block_count(), 2);
        assert!(data.block_bytes(0).len() > 500);
    }

    #[test]
    fn test_max_version_watermark() {
        use crate::key::key_with_ts;

        let mut builder = Builder::new(Config::default());
        builder.add_key(&Entry::new(key_with_ts("a", 3), "v"));
        builder.add_key(&Entry::new(key_with_ts("b", 11), "v"));
        builder.add_key(&Entry::new(key_with_ts("c", 7), "v"));

        let data = builder.done();
        let index = TableIndex::decode(&data.index).unwrap();
        assert_eq!(index.max_version, 11);
        assert_eq!(index.key_count, 3);
    }

    #[test]
    fn test_stale_key_accounting() {
        let mut builder = Builder::new(Config::default());
        assert_eq!(builder.stale_data_size(), 0);
        builder.add_stale_key(&Entry::new("old-key", "old-value"));
        assert!(builder.stale_data_size() >= "old-key".len() + "old-value".len());
    }

    #[test]
    fn test_reached_capacity() {
        let mut builder = Builder::new(Config::default().block_size(64).table_size(256));
        assert!(!builder.reached_capacity());
        for i in 0..64 {
            builder.add_key(&Entry::new(format!("key-{i:04}"), "some value here"));
        }
        assert!(builder.reached_capacity());
    }

    #[test]
    fn test_finish_layout_footer() {
        let mut builder = Builder::new(Config::default());
        builder.add_key(&Entry::new("k", "v"));
        let buf = builder.finish();

        // Footer: ... index ‖ u32(index_len) ‖ checksum ‖ u32(checksum_len)
        let checksum_len = LittleEndian::read_u32(&buf[buf.len() - 4..]) as usize;
        assert_eq!(checksum_len, CHECKSUM_SIZE);
        let index_len_at = buf.len() - 4 - checksum_len - 4;
        let index_len = LittleEndian::read_u32(&buf[index_len_at..]) as usize;
        let index_start = index_len_at - index_len;
        let index = TableIndex::decode(&buf[index_start..index_start + index_len]).unwrap();
        assert_eq!(index.key_count, 1);
        assert!(!index.bloom_filter.is_empty());
    }
}
