use crate::cache::victim::VictimPage;
use crate::mem::{MemoryAllocator, MemoryError};
use crate::pages::{MAX_PAGE_ID, PageId};
use crate::storage::FileId;

use std::hint::spin_loop;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy_derive::*;

/// Highest pin count a slot accepts.
pub const MAX_USAGE_COUNT: u64 = (1 << 31) - 1;

/// Highest file id a binding word can hold.
pub const MAX_FILE_ID: u32 = (1 << FILE_ID_BITS) - 1;

// state word
const USAGE_MASK: u64 = (1 << 32) - 1;
const DIRTY: u64 = 1 << 61;
const REFERENCED: u64 = 1 << 62;
const EXCLUSIVE: u64 = 1 << 63;

// latch word: writer bit and reader count
const LATCH_WRITER: u64 = 1 << 63;
const LATCH_READERS: u64 = LATCH_WRITER - 1;

// binding word: file page id above the file id
const FILE_ID_BITS: u32 = 21;
const FILE_ID_MASK: u64 = (1 << FILE_ID_BITS) - 1;

/// The metadata of one cache slot, as laid out in the off-heap table.
///
/// ```text
/// +--------+---------------------------------------------------------+
/// | state  | exclusive:1 | referenced:1 | dirty:1 | .. | usage:32    |
/// | latch  | writer:1 | readers:63                                   |
/// | binding| file page id:43 | file id:21 (0 = unbound)              |
/// | address| buffer the slot currently exposes (own or victim page)  |
/// +--------+---------------------------------------------------------+
/// ```
///
/// An all-zero record is a free, unpinned, unlatched, unbound slot.
#[derive(FromBytes, IntoBytes, KnownLayout)]
#[repr(C)]
struct PageRecord {
    state: AtomicU64,
    latch: AtomicU64,
    binding: AtomicU64,
    address: AtomicU64,
}

/// Size of a slot record in bytes.
pub const RECORD_SIZE: usize = std::mem::size_of::<PageRecord>();

const _: () = assert!(RECORD_SIZE == 32);

#[derive(Error, Debug)]
pub enum PageListError {
    #[error("slot is exclusively locked")]
    Exclusive,
    #[error("slot {slot} is pinned {MAX_USAGE_COUNT} times")]
    PinOverflow { slot: usize },
    #[error("{pages} pages of {page_size} bytes overflow the address space")]
    TooLarge { pages: usize, page_size: usize },
    #[error("page table memory has an unexpected layout")]
    Layout,
    #[error("cannot allocate the page table")]
    Memory(#[from] MemoryError),
}

/// An opaque reference to a slot record, the address of the record.
///
/// Cheap to copy. [`PageList::to_id`] is the inverse of [`PageList::deref`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PageRef(usize);

/// The page metadata table: one fixed-width record per cache slot, stored
/// contiguously off-heap, plus the page-sized buffers the slots own.
///
/// Slot `n` always owns the buffer at offset `n * page_size` of the buffer
/// region. Pinning and unpinning are single CAS operations on the state word.
/// Changing what a slot holds requires the exclusive bit of the same word,
/// which can only be taken while the slot is unpinned and keeps pins out until
/// it is released.
pub struct PageList {
    records: NonNull<PageRecord>,
    page_count: usize,
    page_size: usize,
    buffers: NonNull<u8>,
    victim: u64,
    _memory: Arc<MemoryAllocator>,
}

// SAFETY: records are only accessed through atomics; buffers are handed out
// under the pin, exclusive and latch protocol implemented here.
unsafe impl Send for PageList {}
unsafe impl Sync for PageList {}

impl PageList {
    /// Allocates a table of `page_count` slots and their buffers from `memory`.
    ///
    /// Every slot starts free and pointing at the victim page.
    pub fn new(
        page_count: usize,
        page_size: usize,
        memory: &Arc<MemoryAllocator>,
        victim: &VictimPage,
        buffer_alignment: usize,
    ) -> Result<Self, PageListError> {
        let too_large = PageListError::TooLarge {
            pages: page_count,
            page_size,
        };
        let table_size = page_count.checked_mul(RECORD_SIZE).ok_or(too_large)?;
        let buffers_size = page_count
            .checked_mul(page_size)
            .ok_or(PageListError::TooLarge {
                pages: page_count,
                page_size,
            })?;

        let table = memory.allocate_aligned(table_size, 64)?;
        // SAFETY: the allocation is fresh, zeroed, `table_size` long and ours alone.
        let bytes = unsafe { std::slice::from_raw_parts_mut(table.as_ptr(), table_size) };
        let records =
            <[PageRecord]>::mut_from_bytes(bytes).map_err(|_| PageListError::Layout)?;
        if records.len() != page_count {
            return Err(PageListError::Layout);
        }

        let victim = victim.address() as u64;
        for record in records.iter_mut() {
            *record.address.get_mut() = victim;
        }
        let records = NonNull::from(records).cast::<PageRecord>();

        let buffers = memory.allocate_aligned(buffers_size, buffer_alignment)?;

        Ok(Self {
            records,
            page_count,
            page_size,
            buffers,
            victim,
            _memory: Arc::clone(memory),
        })
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the reference of slot `slot`.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is not below [`PageList::page_count`].
    #[inline]
    pub fn deref(&self, slot: usize) -> PageRef {
        assert!(
            slot < self.page_count,
            "slot {slot} out of {}",
            self.page_count
        );
        PageRef(self.records.as_ptr() as usize + slot * RECORD_SIZE)
    }

    /// Returns the slot id `page_ref` was created from.
    #[inline]
    pub fn to_id(&self, page_ref: PageRef) -> usize {
        (page_ref.0 - self.records.as_ptr() as usize) / RECORD_SIZE
    }

    #[inline]
    fn record(&self, page_ref: PageRef) -> &PageRecord {
        debug_assert!(self.contains(page_ref));
        // SAFETY: refs are only created by `deref`, pointing at a live record.
        unsafe { &*(page_ref.0 as *const PageRecord) }
    }

    fn contains(&self, page_ref: PageRef) -> bool {
        let base = self.records.as_ptr() as usize;
        page_ref.0 >= base
            && page_ref.0 < base + self.page_count * RECORD_SIZE
            && (page_ref.0 - base) % RECORD_SIZE == 0
    }

    // ---- usage (pin) count ----

    /// Pins the slot and marks it recently used.
    ///
    /// Refused with [`PageListError::Exclusive`] while the slot is being
    /// evicted or faulted in.
    #[inline]
    pub fn increment_usage(&self, page_ref: PageRef) -> Result<(), PageListError> {
        let state = &self.record(page_ref).state;
        let mut current = state.load(Ordering::Acquire);
        loop {
            if current & EXCLUSIVE != 0 {
                return Err(PageListError::Exclusive);
            }
            if current & USAGE_MASK >= MAX_USAGE_COUNT {
                return Err(PageListError::PinOverflow {
                    slot: self.to_id(page_ref),
                });
            }
            match state.compare_exchange_weak(
                current,
                (current + 1) | REFERENCED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Unpins the slot. Returns `true` if that was the last pin.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not pinned.
    #[inline]
    pub fn decrement_usage(&self, page_ref: PageRef) -> bool {
        let state = &self.record(page_ref).state;
        let mut current = state.load(Ordering::Acquire);
        loop {
            assert!(
                current & USAGE_MASK != 0,
                "usage count of slot {} decremented below zero",
                self.to_id(page_ref)
            );
            match state.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current & USAGE_MASK == 1,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn usage_count(&self, page_ref: PageRef) -> u64 {
        self.record(page_ref).state.load(Ordering::Acquire) & USAGE_MASK
    }

    // ---- exclusive lock ----

    /// Takes the exclusive lock if the slot is unpinned and not already locked.
    pub fn try_exclusive_lock(&self, page_ref: PageRef) -> bool {
        let state = &self.record(page_ref).state;
        let mut current = state.load(Ordering::Acquire);
        loop {
            if current & (EXCLUSIVE | USAGE_MASK) != 0 {
                return false;
            }
            match state.compare_exchange_weak(
                current,
                current | EXCLUSIVE,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn unlock_exclusive(&self, page_ref: PageRef) {
        let previous = self
            .record(page_ref)
            .state
            .fetch_and(!EXCLUSIVE, Ordering::AcqRel);
        assert!(previous & EXCLUSIVE != 0, "slot is not exclusively locked");
    }

    /// Releases the exclusive lock and leaves the slot pinned once, in a single step.
    pub fn unlock_exclusive_to_pinned(&self, page_ref: PageRef) {
        let state = &self.record(page_ref).state;
        let mut current = state.load(Ordering::Acquire);
        loop {
            assert!(current & EXCLUSIVE != 0, "slot is not exclusively locked");
            debug_assert_eq!(current & USAGE_MASK, 0);
            let pinned = ((current & !EXCLUSIVE) + 1) | REFERENCED;
            match state.compare_exchange_weak(
                current,
                pinned,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn is_exclusive(&self, page_ref: PageRef) -> bool {
        self.record(page_ref).state.load(Ordering::Acquire) & EXCLUSIVE != 0
    }

    // ---- clock and dirty bits ----

    pub fn is_referenced(&self, page_ref: PageRef) -> bool {
        self.record(page_ref).state.load(Ordering::Acquire) & REFERENCED != 0
    }

    /// Clears the referenced bit. Returns whether it was set.
    pub fn try_clear_referenced(&self, page_ref: PageRef) -> bool {
        self.record(page_ref)
            .state
            .fetch_and(!REFERENCED, Ordering::AcqRel)
            & REFERENCED
            != 0
    }

    pub fn is_dirty(&self, page_ref: PageRef) -> bool {
        self.record(page_ref).state.load(Ordering::Acquire) & DIRTY != 0
    }

    /// Only pin holders and exclusive owners may dirty a slot.
    pub fn mark_dirty(&self, page_ref: PageRef) {
        let previous = self
            .record(page_ref)
            .state
            .fetch_or(DIRTY, Ordering::AcqRel);
        debug_assert!(previous & (EXCLUSIVE | USAGE_MASK) != 0);
    }

    /// Clears the dirty bit. Returns whether it was set.
    pub fn clear_dirty(&self, page_ref: PageRef) -> bool {
        self.record(page_ref)
            .state
            .fetch_and(!DIRTY, Ordering::AcqRel)
            & DIRTY
            != 0
    }

    // ---- identity ----

    /// The file and page the slot holds, `None` when the slot is free.
    pub fn binding(&self, page_ref: PageRef) -> Option<(FileId, PageId)> {
        let binding = self.record(page_ref).binding.load(Ordering::Acquire);
        let file_id = (binding & FILE_ID_MASK) as u32;
        (file_id != 0).then(|| (FileId(file_id), PageId::new(binding >> FILE_ID_BITS)))
    }

    pub fn file_id(&self, page_ref: PageRef) -> FileId {
        self.binding(page_ref)
            .map(|(file_id, _)| file_id)
            .unwrap_or(FileId::NONE)
    }

    pub fn file_page_id(&self, page_ref: PageRef) -> Option<PageId> {
        self.binding(page_ref).map(|(_, page_id)| page_id)
    }

    pub fn is_bound_to(&self, page_ref: PageRef, file_id: FileId, page_id: PageId) -> bool {
        self.record(page_ref).binding.load(Ordering::Acquire) == encode_binding(file_id, page_id)
    }

    /// Gives the slot a new identity. The caller holds the exclusive lock.
    pub fn bind(&self, page_ref: PageRef, file_id: FileId, page_id: PageId) {
        debug_assert!(self.is_exclusive(page_ref));
        assert!(
            !file_id.is_none() && file_id.get() <= MAX_FILE_ID,
            "file id {file_id} cannot be bound"
        );
        assert!(page_id.get() <= MAX_PAGE_ID, "page {page_id} cannot be bound");
        self.record(page_ref)
            .binding
            .store(encode_binding(file_id, page_id), Ordering::Release);
    }

    /// Marks the slot free. The caller holds the exclusive lock.
    pub fn unbind(&self, page_ref: PageRef) {
        debug_assert!(self.is_exclusive(page_ref));
        self.record(page_ref).binding.store(0, Ordering::Release);
    }

    // ---- buffers ----

    /// Offset of the slot's own buffer in the buffer region. Never changes.
    pub fn buffer_offset(&self, slot: usize) -> usize {
        assert!(slot < self.page_count);
        slot * self.page_size
    }

    /// The slot's own buffer.
    pub fn buffer(&self, page_ref: PageRef) -> *mut u8 {
        let offset = self.buffer_offset(self.to_id(page_ref));
        // SAFETY: offset is inside the buffer region.
        unsafe { self.buffers.as_ptr().add(offset) }
    }

    /// The buffer the slot currently exposes: its own, or the victim page while
    /// the slot is free or changing identity.
    pub fn address(&self, page_ref: PageRef) -> *mut u8 {
        self.record(page_ref).address.load(Ordering::Acquire) as *mut u8
    }

    pub fn victim_address(&self) -> *mut u8 {
        self.victim as *mut u8
    }

    /// Points the slot at the victim page. The caller holds the exclusive lock.
    pub fn redirect_to_victim(&self, page_ref: PageRef) {
        debug_assert!(self.is_exclusive(page_ref));
        self.record(page_ref)
            .address
            .store(self.victim, Ordering::Release);
    }

    /// Points the slot back at its own buffer. The caller holds the exclusive lock.
    pub fn restore_buffer(&self, page_ref: PageRef) {
        debug_assert!(self.is_exclusive(page_ref));
        self.record(page_ref)
            .address
            .store(self.buffer(page_ref) as u64, Ordering::Release);
    }

    // ---- content latch ----

    /// Latches the content for reading. Spins while a writer holds it.
    pub fn latch_shared(&self, page_ref: PageRef) {
        let latch = &self.record(page_ref).latch;
        let mut backoff = Backoff::new();
        loop {
            let current = latch.load(Ordering::Relaxed);
            if current & LATCH_WRITER == 0
                && latch
                    .compare_exchange_weak(current, current + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            backoff.snooze();
        }
    }

    /// Latches the content for reading unless a writer holds it.
    pub fn try_latch_shared(&self, page_ref: PageRef) -> bool {
        let latch = &self.record(page_ref).latch;
        let mut current = latch.load(Ordering::Relaxed);
        while current & LATCH_WRITER == 0 {
            match latch.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    pub fn unlatch_shared(&self, page_ref: PageRef) {
        let previous = self
            .record(page_ref)
            .latch
            .fetch_sub(1, Ordering::Release);
        debug_assert!(previous & LATCH_READERS != 0);
    }

    /// Latches the content for writing. Spins until no reader or writer holds it.
    pub fn latch_exclusive(&self, page_ref: PageRef) {
        let latch = &self.record(page_ref).latch;
        let mut backoff = Backoff::new();
        while latch
            .compare_exchange_weak(0, LATCH_WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
    }

    pub fn unlatch_exclusive(&self, page_ref: PageRef) {
        let previous = self.record(page_ref).latch.swap(0, Ordering::Release);
        debug_assert_eq!(previous, LATCH_WRITER);
    }
}

fn encode_binding(file_id: FileId, page_id: PageId) -> u64 {
    (page_id.get() << FILE_ID_BITS) | file_id.get() as u64
}

/// Spin, then yield.
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;

    pub(crate) fn new() -> Self {
        Self { step: 0 }
    }

    pub(crate) fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..1 << self.step {
                spin_loop();
            }
            self.step += 1;
        } else {
            std::thread::yield_now();
        }
    }
}
