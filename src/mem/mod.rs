//! Off-heap memory for the page cache.

mod allocator;
mod tracker;

pub use allocator::{MemoryAllocator, MemoryError};
pub use tracker::{LimitExceeded, MemoryTracker};
