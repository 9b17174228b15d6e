use crate::mem::tracker::{LimitExceeded, MemoryTracker};

use std::io;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("out of memory")]
    OutOfMemory(#[from] LimitExceeded),
    #[error("cannot map {size} bytes")]
    Map {
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(usize),
    #[error("allocation of {0} bytes overflows the address space")]
    Overflow(usize),
}

/// A mapping owned by the allocator.
struct Region {
    base: NonNull<u8>,
    len: usize,
    /// bytes accounted for in the tracker
    charged: usize,
}

// SAFETY: a region is only a record of an anonymous mapping, unmapped once by
// the allocator that owns it.
unsafe impl Send for Region {}

/// Hands out zeroed, aligned, off-heap memory.
///
/// Every allocation is an anonymous private mapping reserved without swap
/// (`MAP_NORESERVE`), so very large caches only consume physical memory for
/// the pages actually touched. Memory is never freed piecemeal: all regions
/// live until the allocator is dropped, which unmaps them and returns their
/// bytes to the [`MemoryTracker`].
pub struct MemoryAllocator {
    tracker: Arc<MemoryTracker>,
    regions: Mutex<Vec<Region>>,
}

// SAFETY: regions are only touched through the mutex; the memory they describe
// is handed out as raw pointers whose synchronization is the caller's business.
unsafe impl Sync for MemoryAllocator {}
unsafe impl Send for MemoryAllocator {}

impl MemoryAllocator {
    pub fn new(tracker: Arc<MemoryTracker>) -> Self {
        Self {
            tracker,
            regions: Mutex::new(Vec::new()),
        }
    }

    pub fn tracker(&self) -> &Arc<MemoryTracker> {
        &self.tracker
    }

    /// Bytes handed out by this allocator, alignment slack excluded.
    pub fn used(&self) -> usize {
        self.regions.lock().iter().map(|r| r.charged).sum()
    }

    /// Allocates `size` zeroed bytes aligned to `alignment`.
    ///
    /// The memory stays valid until the allocator is dropped.
    pub fn allocate_aligned(
        &self,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, MemoryError> {
        if !alignment.is_power_of_two() {
            return Err(MemoryError::InvalidAlignment(alignment));
        }
        let size = size.max(1);

        // mmap is page aligned, bigger alignments need slack to slide into
        let slack = alignment.saturating_sub(os_page_size());
        let len = size
            .checked_add(slack)
            .ok_or(MemoryError::Overflow(size))?;

        self.tracker.reserve(size)?;

        let base = match map_anonymous(len) {
            Ok(base) => base,
            Err(source) => {
                self.tracker.release(size);
                return Err(MemoryError::Map { size: len, source });
            }
        };

        let offset = base.as_ptr().align_offset(alignment);
        debug_assert!(offset <= slack);
        // SAFETY: offset is within the slack mapped past `size`.
        let aligned = unsafe { NonNull::new_unchecked(base.as_ptr().add(offset)) };

        self.regions.lock().push(Region {
            base,
            len,
            charged: size,
        });
        log::trace!("mapped {len} bytes for an allocation of {size} aligned to {alignment}");

        Ok(aligned)
    }
}

impl Drop for MemoryAllocator {
    fn drop(&mut self) {
        for region in self.regions.get_mut().drain(..) {
            // SAFETY: the region was mapped by `map_anonymous` with this length and
            // nothing borrowed from the allocator outlives it.
            let result = unsafe { libc::munmap(region.base.as_ptr().cast(), region.len) };
            if result != 0 {
                log::error!(
                    "munmap of {} bytes failed: {}",
                    region.len,
                    io::Error::last_os_error()
                );
            }
            self.tracker.release(region.charged);
        }
    }
}

fn os_page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

fn map_anonymous(len: usize) -> io::Result<NonNull<u8>> {
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    // SAFETY: anonymous mapping without a hint address, nothing aliases it.
    let raw = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, -1, 0) };
    if raw == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(raw.cast()).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_zeroed_and_aligned() {
        let allocator = MemoryAllocator::new(Arc::new(MemoryTracker::unbounded()));
        for alignment in [8, 4096, 1 << 16] {
            let ptr = allocator.allocate_aligned(10_000, alignment).unwrap();
            assert_eq!(ptr.as_ptr() as usize % alignment, 0);
            let bytes = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), 10_000) };
            assert!(bytes.iter().all(|&b| b == 0));
            bytes.fill(0xAB);
        }
        assert_eq!(allocator.used(), 30_000);
    }

    #[test]
    fn budget_is_enforced() {
        let tracker = Arc::new(MemoryTracker::with_limit(64 * 1024));
        let allocator = MemoryAllocator::new(tracker.clone());
        allocator.allocate_aligned(48 * 1024, 4096).unwrap();
        let err = allocator.allocate_aligned(32 * 1024, 4096).unwrap_err();
        assert!(matches!(err, MemoryError::OutOfMemory(_)));
        assert_eq!(tracker.used(), 48 * 1024);
    }

    #[test]
    fn drop_releases_accounting() {
        let tracker = Arc::new(MemoryTracker::unbounded());
        {
            let allocator = MemoryAllocator::new(tracker.clone());
            allocator.allocate_aligned(1 << 20, 4096).unwrap();
            allocator.allocate_aligned(100, 8).unwrap();
            assert_eq!(tracker.used(), (1 << 20) + 100);
        }
        assert_eq!(tracker.used(), 0);
        assert_eq!(tracker.peak(), (1 << 20) + 100);
    }

    #[test]
    fn invalid_alignment() {
        let allocator = MemoryAllocator::new(Arc::new(MemoryTracker::unbounded()));
        assert!(matches!(
            allocator.allocate_aligned(10, 24),
            Err(MemoryError::InvalidAlignment(24))
        ));
    }
}
