//! A page cache for paged storage files.
//!
//! Pages of many files share a fixed set of off-heap slots. Callers pin a page
//! with [`PageCache::acquire`], read or write it through the returned handle,
//! and unpin it by dropping the handle. Dirty pages are written back when they
//! are evicted, flushed or when their file is closed.

pub mod cache;
pub mod config;
pub mod mem;
pub mod pages;
pub mod storage;

pub use cache::{CacheStats, PageCache, PageCacheError, PageHandle};
pub use config::{CONFIG, Config, ConfigError};
pub use pages::{PageId, PageIntent};
pub use storage::{FileId, FileSwapper, MemorySwapper, PageSwapper, StorageError};
