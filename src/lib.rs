pub mod bloom;
pub mod cache;
pub mod checksum;
pub mod config;
pub mod entry;
pub mod error;
pub mod key;
pub mod skiplist;
pub mod sstable;

pub use cache::Cache;
pub use config::Config;
pub use entry::{Entry, ValueStruct};
pub use error::{Error, Result};
pub use skiplist::Skiplist;
