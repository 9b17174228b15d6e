use crate::pages::PageId;
use crate::storage::{PageSwapper, StorageError};

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

/// Keeps pages on the heap. Used by tests and tools that need a swapper
/// without touching the file system.
///
/// Writes can be made to fail on demand to exercise flush error paths.
pub struct MemorySwapper {
    page_size: usize,
    pages: RwLock<HashMap<PageId, Box<[u8]>>>,
    reads: AtomicU64,
    writes: AtomicU64,
    forces: AtomicU64,
    fail_writes: AtomicBool,
}

impl MemorySwapper {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            pages: RwLock::new(HashMap::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            forces: AtomicU64::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Content last written for `page_id`.
    pub fn page(&self, page_id: PageId) -> Option<Vec<u8>> {
        self.pages.read().get(&page_id).map(|page| page.to_vec())
    }

    /// Stores `data` as if it had been written earlier, without counting a write.
    pub fn preload(&self, page_id: PageId, data: &[u8]) {
        assert_eq!(data.len(), self.page_size);
        self.pages.write().insert(page_id, data.into());
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn forces(&self) -> u64 {
        self.forces.load(Ordering::Relaxed)
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    fn check_buffer(&self, len: usize) -> Result<(), StorageError> {
        if len != self.page_size {
            return Err(StorageError::BufferSize {
                expected: self.page_size,
                actual: len,
            });
        }
        Ok(())
    }
}

impl PageSwapper for MemorySwapper {
    fn read(&self, page_id: PageId, buf: &mut [u8]) -> Result<(), StorageError> {
        self.check_buffer(buf.len())?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        match self.pages.read().get(&page_id) {
            Some(page) => buf.copy_from_slice(page),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write(&self, page_id: PageId, buf: &[u8]) -> Result<(), StorageError> {
        self.check_buffer(buf.len())?;
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(StorageError::Io(io::Error::other("injected write failure")));
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.pages.write().insert(page_id, buf.into());
        Ok(())
    }

    fn force(&self) -> Result<(), StorageError> {
        self.forces.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn last_page_id(&self) -> Option<PageId> {
        self.pages.read().keys().max().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write() {
        let swapper = MemorySwapper::new(16);
        let mut buf = [1u8; 16];
        swapper.read(PageId::new(0), &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);

        swapper.write(PageId::new(5), &[5u8; 16]).unwrap();
        swapper.read(PageId::new(5), &mut buf).unwrap();
        assert_eq!(buf, [5u8; 16]);
        assert_eq!(swapper.reads(), 2);
        assert_eq!(swapper.writes(), 1);
        assert_eq!(swapper.last_page_id(), Some(PageId::new(5)));
    }

    #[test]
    fn injected_failures() {
        let swapper = MemorySwapper::new(16);
        swapper.set_fail_writes(true);
        assert!(swapper.write(PageId::new(0), &[0u8; 16]).is_err());
        assert_eq!(swapper.page(PageId::new(0)), None);
        swapper.set_fail_writes(false);
        swapper.write(PageId::new(0), &[3u8; 16]).unwrap();
        assert_eq!(swapper.page(PageId::new(0)), Some(vec![3u8; 16]));
    }
}
