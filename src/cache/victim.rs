use crate::mem::{MemoryAllocator, MemoryError};

use std::ptr::NonNull;
use std::sync::Arc;

/// The page every slot points at while it holds nothing, or while its content
/// is being written back and replaced.
///
/// Anyone reading a slot's current address without a pin may land here. The
/// content is zeros and carries no meaning; a handle is only trusted after the
/// slot is pinned and its identity checked.
pub struct VictimPage {
    address: NonNull<u8>,
    size: usize,
    _memory: Arc<MemoryAllocator>,
}

// SAFETY: the victim page is never written through the cache API.
unsafe impl Send for VictimPage {}
unsafe impl Sync for VictimPage {}

impl VictimPage {
    pub fn new(page_size: usize, memory: &Arc<MemoryAllocator>) -> Result<Self, MemoryError> {
        let address = memory.allocate_aligned(page_size, page_size.next_power_of_two().min(4096))?;
        Ok(Self {
            address,
            size: page_size,
            _memory: Arc::clone(memory),
        })
    }

    pub fn address(&self) -> *mut u8 {
        self.address.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_victim(&self, address: *const u8) -> bool {
        std::ptr::eq(address, self.address.as_ptr())
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: `size` zeroed bytes owned by the allocator we keep alive.
        unsafe { std::slice::from_raw_parts(self.address.as_ptr(), self.size) }
    }
}
