/// Configuration for the indexing core: memtable sizing, SSTable geometry
/// and cache capacity.
#[derive(Debug, Clone)]
pub struct Config {
    /// Target size of a single SSTable data block (default: 4KB). A block
    /// may exceed this when a single entry is larger than the target.
    pub block_size: usize,

    /// Target size of a finished SSTable (default: 2MB). Drives
    /// `Builder::reached_capacity`.
    pub table_size: usize,

    /// False positive rate for the per-table bloom filter (default: 0.01).
    /// Zero disables the filter.
    pub bloom_false_positive: f64,

    /// Capacity of the memtable arena in bytes (default: 64MB). The arena
    /// is pre-sized and does not grow while concurrent writers are active.
    pub arena_size: usize,

    /// Number of entries the block cache admits (default: 8192).
    pub cache_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: 4 * 1024,
            table_size: 2 * 1024 * 1024,
            bloom_false_positive: 0.01,
            arena_size: 64 * 1024 * 1024, // 64MB
            cache_size: 8192,
        }
    }
}

impl Config {
    /// Set the target block size
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Set the target SSTable size
    pub fn table_size(mut self, size: usize) -> Self {
        self.table_size = size;
        self
    }

    /// Set the bloom filter false positive rate
    pub fn bloom_false_positive(mut self, fp: f64) -> Self {
        self.bloom_false_positive = fp;
        self
    }

    /// Set the memtable arena capacity
    pub fn arena_size(mut self, size: usize) -> Self {
        self.arena_size = size;
        self
    }

    /// Set the cache capacity in entries
    pub fn cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }
}
