mod backend;
mod file;
mod memory;

pub use backend::{FileId, PageSwapper, StorageError};
pub use file::FileSwapper;
pub use memory::MemorySwapper;
