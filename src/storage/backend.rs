use crate::pages::PageId;

use thiserror::Error;

/// Identifies an open paged file, and the swapper behind it, inside a cache.
///
/// Id 0 is never handed out: slots use it to mean "no file".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u32);

impl FileId {
    pub const NONE: FileId = FileId(0);

    pub fn get(&self) -> u32 {
        self.0
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("io error")]
    Io(#[from] std::io::Error),
    #[error("buffer of {actual} bytes for a page of {expected} bytes")]
    BufferSize { expected: usize, actual: usize },
}

/// Moves the bytes of a single paged file between the cache and durable storage.
///
/// The page cache calls `read` when it faults a page in and `write` when it
/// evicts or flushes a dirty page. Buffers are exactly one page long. Calls for
/// different pages may run concurrently.
pub trait PageSwapper: Sync + Send {
    /// Fills `buf` with the content of `page_id`. Pages never written read as zeros.
    fn read(&self, page_id: PageId, buf: &mut [u8]) -> Result<(), StorageError>;

    /// Writes `buf` as the content of `page_id`.
    fn write(&self, page_id: PageId, buf: &[u8]) -> Result<(), StorageError>;

    /// Makes previous writes durable.
    fn force(&self) -> Result<(), StorageError>;

    /// Highest page ever written, if any.
    fn last_page_id(&self) -> Option<PageId>;
}
