use crate::cache::clock::ClockSweep;
use crate::cache::pagelist::{Backoff, PageList, PageListError, PageRef};
use crate::cache::stats::{CacheStats, Counters};
use crate::cache::swappers::{FreedSwappers, SwapperError, SwapperSet};
use crate::cache::table::{FaultLatch, Mapping, PageKey, TranslationTable};
use crate::cache::victim::VictimPage;
use crate::config::{Config, ConfigError};
use crate::mem::{MemoryAllocator, MemoryError, MemoryTracker};
use crate::pages::{PageId, PageIntent};
use crate::storage::{FileId, FileSwapper, PageSwapper, StorageError};

use std::collections::HashSet;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PageCacheError {
    #[error("no evictable slot: every page in the cache is pinned")]
    Exhausted,
    #[error("cannot flush page {page_id} of file {file_id}")]
    Flush {
        file_id: FileId,
        page_id: PageId,
        #[source]
        source: StorageError,
    },
    #[error("cannot read page {page_id} of file {file_id}")]
    Read {
        file_id: FileId,
        page_id: PageId,
        #[source]
        source: StorageError,
    },
    #[error("file {0} still has pinned or loading pages")]
    FileBusy(FileId),
    #[error("page {0} is beyond the addressable range")]
    PageOutOfRange(PageId),
    #[error("swapper registry")]
    Swapper(#[from] SwapperError),
    #[error("page list")]
    PageList(#[from] PageListError),
    #[error("memory")]
    Memory(#[from] MemoryError),
    #[error("configuration")]
    Config(#[from] ConfigError),
    #[error("storage")]
    Storage(#[from] StorageError),
}

/// Slots holding nothing. Slots never used are handed out in order before the
/// released ones.
struct FreeSlots {
    next_fresh: usize,
    page_count: usize,
    released: Vec<usize>,
}

impl FreeSlots {
    fn new(page_count: usize) -> Self {
        Self {
            next_fresh: 0,
            page_count,
            released: Vec::new(),
        }
    }

    fn pop(&mut self) -> Option<usize> {
        if let Some(slot) = self.released.pop() {
            return Some(slot);
        }
        if self.next_fresh < self.page_count {
            self.next_fresh += 1;
            return Some(self.next_fresh - 1);
        }
        None
    }

    fn push(&mut self, slot: usize) {
        self.released.push(slot);
    }

    fn len(&self) -> usize {
        self.page_count - self.next_fresh + self.released.len()
    }
}

/// The page cache: pinned access to the fixed-size pages of many files
/// through a fixed set of off-heap slots.
///
/// A page is faulted into a slot the first time it is acquired. When no slot
/// is free, the clock picks an unpinned one, writes it back if it is dirty and
/// reuses it. Concurrent acquisitions of a page that is not cached collapse to
/// a single fault; the other callers wait for it and share the slot.
///
/// ```text
///  acquire(file, page)
///        |
///        v
///  +-------------+  hit   +-------------------+
///  | translation |------->| pin slot (CAS)    |-----> PageHandle
///  |    table    |        +-------------------+          |
///  +-------------+                                       | drop
///        | miss                                          v
///        v                                        unlatch + unpin
///  +-------------+  none  +-------------------+
///  | free slots  |------->| clock: lock slot, |
///  +-------------+        | flush if dirty    |
///        |                +-------------------+
///        v                         |
///  read page, bind slot, pin <-----+
/// ```
pub struct PageCache {
    page_size: usize,
    direct_io: bool,
    pages: PageList,
    victim: VictimPage,
    swappers: SwapperSet,
    table: TranslationTable,
    free: Mutex<FreeSlots>,
    clock: ClockSweep,
    counters: Counters,
    memory: Arc<MemoryAllocator>,
}

impl PageCache {
    /// Creates a cache of `config.slot_count()` slots, drawing its memory
    /// from the budget of `tracker`.
    pub fn new(config: &Config, tracker: Arc<MemoryTracker>) -> Result<Self, PageCacheError> {
        config.validate()?;

        let memory = Arc::new(MemoryAllocator::new(tracker));
        let victim = VictimPage::new(config.page_size, &memory)?;
        let pages = PageList::new(
            config.slot_count(),
            config.page_size,
            &memory,
            &victim,
            config.buffer_alignment,
        )?;

        info!(
            "page cache of {} slots of {} bytes, {} bytes off-heap",
            pages.page_count(),
            pages.page_size(),
            memory.used()
        );

        Ok(Self {
            page_size: config.page_size,
            direct_io: config.direct_io,
            free: Mutex::new(FreeSlots::new(pages.page_count())),
            pages,
            victim,
            swappers: SwapperSet::with_max_id(config.max_file_id),
            table: TranslationTable::new(config.table_shards),
            clock: ClockSweep::new(),
            counters: Counters::default(),
            memory,
        })
    }

    /// Creates a cache with its own tracker, limited by `config.memory_budget`.
    pub fn with_config(config: &Config) -> Result<Self, PageCacheError> {
        let tracker = match config.memory_budget {
            Some(budget) => MemoryTracker::with_limit(budget),
            None => MemoryTracker::unbounded(),
        };
        Self::new(config, Arc::new(tracker))
    }

    // ---- files ----

    /// Registers a paged file. Its pages are addressed with the returned id.
    pub fn open_file(&self, swapper: Arc<dyn PageSwapper>) -> Result<FileId, PageCacheError> {
        let file_id = self.swappers.allocate(swapper)?;
        info!("opened file {file_id}");
        Ok(file_id)
    }

    /// Opens `path` with a [`FileSwapper`] and registers it.
    pub fn map_file<P: AsRef<Path>>(&self, path: P) -> Result<FileId, PageCacheError> {
        let swapper = FileSwapper::open(path, self.page_size, self.direct_io)?;
        self.open_file(Arc::new(swapper))
    }

    /// Flushes the file, evicts its pages and releases its id.
    ///
    /// Fails with [`PageCacheError::FileBusy`] if some of its pages are still
    /// pinned. The file is closed regardless: later acquisitions fail with
    /// [`SwapperError::Stale`], and its remaining pages are written back,
    /// evicted and its id made reusable by a later [`PageCache::vacuum`].
    pub fn close_file(&self, file_id: FileId) -> Result<(), PageCacheError> {
        self.flush_file(file_id)?;
        self.swappers.free(file_id)?;
        info!("closed file {file_id}");
        self.vacuum()?;
        Ok(())
    }

    /// Evicts the pages of closed files, forces the files and makes their ids
    /// reusable. Returns the number of ids recycled.
    pub fn vacuum(&self) -> Result<usize, PageCacheError> {
        self.swappers.vacuum(|freed| self.evict_files(freed))
    }

    fn evict_files(&self, freed: &FreedSwappers) -> Result<(), PageCacheError> {
        let file_ids: HashSet<FileId> = freed.iter().map(|(file_id, _)| *file_id).collect();

        for (key, mapping) in self.table.entries_of(|file_id| file_ids.contains(&file_id)) {
            let slot = match mapping {
                Mapping::Loaded(slot) => slot,
                Mapping::Faulting(_) => return Err(PageCacheError::FileBusy(key.file_id)),
            };
            let page_ref = self.pages.deref(slot);
            if !self.pages.try_exclusive_lock(page_ref) {
                return Err(PageCacheError::FileBusy(key.file_id));
            }
            if !self.pages.is_bound_to(page_ref, key.file_id, key.page_id) {
                // recycled since the table was copied
                self.pages.unlock_exclusive(page_ref);
                continue;
            }
            self.evict_locked(slot)?;
            self.release_free_slot(slot);
        }

        for (file_id, swapper) in freed {
            swapper.force()?;
            debug!("forced closed file {file_id}");
        }

        Ok(())
    }

    // ---- pages ----

    /// Pins page `page_id` of `file_id` in the cache, faulting it in if needed.
    ///
    /// The page stays in its slot until the handle is dropped or given back to
    /// [`PageCache::release`]. Read handles share the content, a write handle
    /// has it to itself and marks the page dirty. A thread must not acquire a
    /// page it already holds for writing. Closed files fail with
    /// [`SwapperError::Stale`], cached pages included.
    pub fn acquire(
        &self,
        file_id: FileId,
        page_id: PageId,
        intent: PageIntent,
    ) -> Result<PageHandle<'_>, PageCacheError> {
        if !page_id.is_addressable() {
            return Err(PageCacheError::PageOutOfRange(page_id));
        }
        let swapper = self.swappers.swapper_for(file_id)?;
        let key = PageKey::new(file_id, page_id);
        let slot = self.pin(key, swapper.as_ref())?;
        Ok(PageHandle::new(self, self.pages.deref(slot), key, intent))
    }

    /// Unpins the page. Same as dropping the handle.
    pub fn release(&self, handle: PageHandle<'_>) {
        assert!(
            std::ptr::eq(handle.cache, self),
            "handle released to a foreign cache"
        );
        drop(handle);
    }

    /// Returns the slot of `key`, pinned.
    fn pin(&self, key: PageKey, swapper: &dyn PageSwapper) -> Result<usize, PageCacheError> {
        let mut backoff = Backoff::new();
        loop {
            let mut shard = self.table.lock(&key);
            match shard.get(&key) {
                Some(Mapping::Loaded(slot)) => {
                    let slot = *slot;
                    let page_ref = self.pages.deref(slot);
                    match self.pages.increment_usage(page_ref) {
                        Ok(()) => {
                            drop(shard);
                            if self.pages.is_bound_to(page_ref, key.file_id, key.page_id) {
                                self.counters.hit();
                                return Ok(slot);
                            }
                            // identity changed under us
                            self.pages.decrement_usage(page_ref);
                        }
                        // being evicted, the mapping goes away shortly
                        Err(PageListError::Exclusive) => drop(shard),
                        Err(err) => return Err(err.into()),
                    }
                    backoff.snooze();
                }
                Some(Mapping::Faulting(latch)) => {
                    let latch = Arc::clone(latch);
                    drop(shard);
                    latch.wait();
                }
                None => {
                    let latch = Arc::new(FaultLatch::new());
                    shard.insert(key, Mapping::Faulting(Arc::clone(&latch)));
                    drop(shard);

                    let result = self.fault(key, swapper);
                    if result.is_err() {
                        self.table.lock(&key).remove(&key);
                    }
                    latch.open();
                    return result;
                }
            }
        }
    }

    /// Brings `key` into a slot. The caller owns the fault latch of `key`.
    fn fault(&self, key: PageKey, swapper: &dyn PageSwapper) -> Result<usize, PageCacheError> {
        let slot = self.grab_slot()?;
        let page_ref = self.pages.deref(slot);

        // SAFETY: the slot is exclusively locked and points at the victim page,
        // nobody else touches its own buffer.
        let buf = unsafe { std::slice::from_raw_parts_mut(self.pages.buffer(page_ref), self.page_size) };
        if let Err(source) = swapper.read(key.page_id, buf) {
            self.release_free_slot(slot);
            return Err(PageCacheError::Read {
                file_id: key.file_id,
                page_id: key.page_id,
                source,
            });
        }

        self.pages.bind(page_ref, key.file_id, key.page_id);
        self.pages.restore_buffer(page_ref);
        self.pages.unlock_exclusive_to_pinned(page_ref);
        self.table.lock(&key).insert(key, Mapping::Loaded(slot));
        self.counters.fault();
        trace!(
            "faulted page {} of file {} into slot {slot}",
            key.page_id, key.file_id
        );

        Ok(slot)
    }

    /// Returns a free slot, exclusively locked and pointing at the victim page.
    fn grab_slot(&self) -> Result<usize, PageCacheError> {
        let free = self.free.lock().pop();
        if let Some(slot) = free {
            let page_ref = self.pages.deref(slot);
            let mut backoff = Backoff::new();
            // flushers and the clock only hold free slots for an instant
            while !self.pages.try_exclusive_lock(page_ref) {
                backoff.snooze();
            }
            self.evict_locked(slot)?;
            return Ok(slot);
        }

        let slot = self
            .clock
            .find_victim(&self.pages)
            .ok_or(PageCacheError::Exhausted)?;
        self.evict_locked(slot)?;
        Ok(slot)
    }

    /// Empties an exclusively locked slot: writes it back if dirty, unmaps the
    /// page and points the slot at the victim page.
    ///
    /// On failure the slot keeps its page, stays dirty, and is unlocked.
    fn evict_locked(&self, slot: usize) -> Result<(), PageCacheError> {
        let page_ref = self.pages.deref(slot);
        let Some((file_id, page_id)) = self.pages.binding(page_ref) else {
            self.pages.redirect_to_victim(page_ref);
            return Ok(());
        };

        if self.pages.is_dirty(page_ref)
            && let Err(err) = self.write_back(page_ref, file_id, page_id)
        {
            self.pages.unlock_exclusive(page_ref);
            self.counters.eviction_failure();
            warn!("evicting page {page_id} of file {file_id} from slot {slot}: {err}");
            return Err(err);
        }

        self.table
            .remove_loaded(&PageKey::new(file_id, page_id), slot);
        self.pages.redirect_to_victim(page_ref);
        self.pages.unbind(page_ref);
        self.counters.eviction();
        debug!("evicted page {page_id} of file {file_id} from slot {slot}");

        Ok(())
    }

    /// Writes the slot's buffer to its file. The caller holds the exclusive
    /// lock, or a pin and the content latch.
    fn write_back(
        &self,
        page_ref: PageRef,
        file_id: FileId,
        page_id: PageId,
    ) -> Result<(), PageCacheError> {
        let swapper = self.swappers.swapper_for_eviction(file_id)?;
        // SAFETY: writers are kept out by the caller's lock or latch.
        let buf = unsafe { std::slice::from_raw_parts(self.pages.buffer(page_ref), self.page_size) };
        swapper
            .write(page_id, buf)
            .map_err(|source| PageCacheError::Flush {
                file_id,
                page_id,
                source,
            })?;
        self.pages.clear_dirty(page_ref);
        self.counters.flush();
        Ok(())
    }

    fn release_free_slot(&self, slot: usize) {
        self.pages.unlock_exclusive(self.pages.deref(slot));
        self.free.lock().push(slot);
    }

    // ---- flushing ----

    /// Writes every dirty page of the file and forces the file.
    ///
    /// Pages latched by a write handle are skipped; they stay dirty and are
    /// written back by a later flush, their eviction or the vacuum of the file.
    pub fn flush_file(&self, file_id: FileId) -> Result<(), PageCacheError> {
        let swapper = self.swappers.swapper_for(file_id)?;
        self.flush_where(|candidate| candidate == file_id)?;
        swapper.force()?;
        Ok(())
    }

    /// Writes every dirty page in the cache and forces all open files.
    pub fn flush_all(&self) -> Result<(), PageCacheError> {
        self.flush_where(|_| true)?;
        for (_, swapper) in self.swappers.live() {
            swapper.force()?;
        }
        Ok(())
    }

    fn flush_where(&self, filter: impl Fn(FileId) -> bool) -> Result<(), PageCacheError> {
        for slot in 0..self.pages.page_count() {
            let page_ref = self.pages.deref(slot);
            if !self.pages.is_dirty(page_ref) {
                continue;
            }
            let Some((file_id, page_id)) = self.pages.binding(page_ref) else {
                continue;
            };
            if !filter(file_id) {
                continue;
            }
            // locked slots are being evicted, and written back by the evictor
            if self.pages.increment_usage(page_ref).is_err() {
                continue;
            }
            let result = if self.pages.is_bound_to(page_ref, file_id, page_id) {
                self.flush_pinned(page_ref, file_id, page_id)
            } else {
                Ok(())
            };
            self.pages.decrement_usage(page_ref);
            result?;
        }
        Ok(())
    }

    fn flush_pinned(
        &self,
        page_ref: PageRef,
        file_id: FileId,
        page_id: PageId,
    ) -> Result<(), PageCacheError> {
        if !self.pages.try_latch_shared(page_ref) {
            debug!("page {page_id} of file {file_id} is being written, not flushed");
            return Ok(());
        }
        let result = if self.pages.is_dirty(page_ref) {
            self.write_back(page_ref, file_id, page_id)
        } else {
            Ok(())
        };
        self.pages.unlatch_shared(page_ref);
        if let Err(err) = &result {
            warn!("flushing page {page_id} of file {file_id}: {err}");
        }
        result
    }

    // ---- introspection ----

    pub fn cache_size_bytes(&self) -> usize {
        self.pages.page_count() * self.page_size
    }

    pub fn page_size_bytes(&self) -> usize {
        self.page_size
    }

    pub fn slot_count(&self) -> usize {
        self.pages.page_count()
    }

    /// Slots holding no page.
    pub fn free_slot_count(&self) -> usize {
        self.free.lock().len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            taken_at: chrono::Utc::now(),
            slot_count: self.slot_count(),
            free_slots: self.free_slot_count(),
            page_size: self.page_size,
            cache_size: self.cache_size_bytes(),
            open_files: self.swappers.live_count(),
            memory_used: self.memory.used(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            faults: self.counters.faults.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            flushes: self.counters.flushes.load(Ordering::Relaxed),
            eviction_failures: self.counters.eviction_failures.load(Ordering::Relaxed),
        }
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        if let Err(err) = self.flush_all() {
            log::error!("page cache dropped with unflushed pages: {err}");
        }
        debug_assert!(self.victim.bytes().iter().all(|&b| b == 0));
    }
}

/// A pinned page. Dropping it unpins the page.
pub struct PageHandle<'cache> {
    cache: &'cache PageCache,
    page_ref: PageRef,
    file_id: FileId,
    page_id: PageId,
    intent: PageIntent,
    data: NonNull<u8>,
}

impl<'cache> PageHandle<'cache> {
    fn new(cache: &'cache PageCache, page_ref: PageRef, key: PageKey, intent: PageIntent) -> Self {
        let pages = &cache.pages;
        match intent {
            PageIntent::Read => pages.latch_shared(page_ref),
            PageIntent::Write => {
                pages.latch_exclusive(page_ref);
                pages.mark_dirty(page_ref);
            }
        }

        let address = pages.address(page_ref);
        debug_assert!(!cache.victim.is_victim(address));
        // SAFETY: a bound slot always exposes its own, non-null buffer.
        let data = unsafe { NonNull::new_unchecked(address) };

        Self {
            cache,
            page_ref,
            file_id: key.file_id,
            page_id: key.page_id,
            intent,
            data,
        }
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn intent(&self) -> PageIntent {
        self.intent
    }

    /// The slot the page lives in.
    pub fn slot(&self) -> usize {
        self.cache.pages.to_id(self.page_ref)
    }
}

impl Deref for PageHandle<'_> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        // SAFETY: pinned and latched, the buffer holds this page.
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.cache.page_size) }
    }
}

impl DerefMut for PageHandle<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        assert!(
            self.intent.is_write(),
            "page {} of file {} was acquired for reading",
            self.page_id,
            self.file_id
        );
        // SAFETY: pinned and latched exclusively, the buffer holds this page.
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.cache.page_size) }
    }
}

impl Drop for PageHandle<'_> {
    fn drop(&mut self) {
        let pages = &self.cache.pages;
        match self.intent {
            PageIntent::Read => pages.unlatch_shared(self.page_ref),
            PageIntent::Write => pages.unlatch_exclusive(self.page_ref),
        }
        pages.decrement_usage(self.page_ref);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySwapper;

    const PAGE_SIZE: usize = 4096;

    fn cache(slots: usize) -> PageCache {
        PageCache::with_config(&Config::with_slots(slots, PAGE_SIZE)).unwrap()
    }

    #[test]
    fn sizes() {
        let cache = cache(10);
        assert_eq!(cache.slot_count(), 10);
        assert_eq!(cache.page_size_bytes(), PAGE_SIZE);
        assert_eq!(cache.cache_size_bytes(), 10 * PAGE_SIZE);
        assert_eq!(cache.free_slot_count(), 10);
    }

    #[test]
    fn invalid_config() {
        let config = Config::with_slots(0, PAGE_SIZE);
        assert!(matches!(
            PageCache::with_config(&config),
            Err(PageCacheError::Config(ConfigError::CacheTooSmall { .. }))
        ));
    }

    #[test]
    fn memory_budget_too_small() {
        let config = Config {
            memory_budget: Some(4 * PAGE_SIZE),
            ..Config::with_slots(8, PAGE_SIZE)
        };
        assert!(matches!(
            PageCache::with_config(&config),
            Err(PageCacheError::PageList(PageListError::Memory(
                MemoryError::OutOfMemory(_)
            )))
        ));
    }

    #[test]
    fn write_then_read() {
        let cache = cache(4);
        let swapper = Arc::new(MemorySwapper::new(PAGE_SIZE));
        let file_id = cache.open_file(swapper.clone()).unwrap();

        let mut page = cache
            .acquire(file_id, PageId::new(0), PageIntent::Write)
            .unwrap();
        page[..5].copy_from_slice(b"hello");
        cache.release(page);

        let page = cache
            .acquire(file_id, PageId::new(0), PageIntent::Read)
            .unwrap();
        assert_eq!(&page[..5], b"hello");
        assert_eq!(page.file_id(), file_id);
        assert_eq!(page.page_id(), PageId::new(0));
        drop(page);

        assert_eq!(swapper.reads(), 1);
        assert_eq!(swapper.writes(), 0);
        let stats = cache.stats();
        assert_eq!(stats.faults, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.free_slots, 3);
        assert_eq!(stats.open_files, 1);

        cache.flush_file(file_id).unwrap();
        assert_eq!(&swapper.page(PageId::new(0)).unwrap()[..5], b"hello");
        assert_eq!(swapper.forces(), 1);

        // clean now, a second flush writes nothing
        cache.flush_file(file_id).unwrap();
        assert_eq!(swapper.writes(), 1);
    }

    #[test]
    #[should_panic(expected = "acquired for reading")]
    fn read_handle_is_not_writable() {
        let cache = cache(4);
        let file_id = cache
            .open_file(Arc::new(MemorySwapper::new(PAGE_SIZE)))
            .unwrap();
        let mut page = cache
            .acquire(file_id, PageId::new(0), PageIntent::Read)
            .unwrap();
        page[0] = 1;
    }

    #[test]
    fn shared_readers() {
        let cache = cache(4);
        let file_id = cache
            .open_file(Arc::new(MemorySwapper::new(PAGE_SIZE)))
            .unwrap();
        let first = cache
            .acquire(file_id, PageId::new(1), PageIntent::Read)
            .unwrap();
        let second = cache
            .acquire(file_id, PageId::new(1), PageIntent::Read)
            .unwrap();
        assert_eq!(first.slot(), second.slot());
        let page_ref = cache.pages.deref(first.slot());
        assert_eq!(cache.pages.usage_count(page_ref), 2);
        drop(first);
        drop(second);
        assert_eq!(cache.pages.usage_count(page_ref), 0);
    }

    #[test]
    fn unknown_file() {
        let cache = cache(4);
        assert!(matches!(
            cache.acquire(FileId(3), PageId::new(0), PageIntent::Read),
            Err(PageCacheError::Swapper(SwapperError::NotFound(FileId(3))))
        ));
        assert!(matches!(
            cache.acquire(FileId::NONE, PageId::new(0), PageIntent::Read),
            Err(PageCacheError::Swapper(SwapperError::OutOfRange(_)))
        ));
        // the failed faults left nothing behind
        assert_eq!(cache.table.len(), 0);
        assert_eq!(cache.free_slot_count(), 4);
    }

    #[test]
    fn page_out_of_range() {
        let cache = cache(4);
        let file_id = cache
            .open_file(Arc::new(MemorySwapper::new(PAGE_SIZE)))
            .unwrap();
        assert!(matches!(
            cache.acquire(file_id, PageId::new(u64::MAX), PageIntent::Read),
            Err(PageCacheError::PageOutOfRange(_))
        ));
    }

    #[test]
    fn eviction_failure_keeps_the_page() {
        let cache = cache(1);
        let swapper = Arc::new(MemorySwapper::new(PAGE_SIZE));
        let file_id = cache.open_file(swapper.clone()).unwrap();

        let mut page = cache
            .acquire(file_id, PageId::new(0), PageIntent::Write)
            .unwrap();
        page.fill(0x42);
        drop(page);

        swapper.set_fail_writes(true);
        let err = cache
            .acquire(file_id, PageId::new(1), PageIntent::Read)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            PageCacheError::Flush { page_id, .. } if page_id == PageId::new(0)
        ));
        assert_eq!(cache.stats().eviction_failures, 1);

        // page 0 is still cached, still dirty
        let page = cache
            .acquire(file_id, PageId::new(0), PageIntent::Read)
            .unwrap();
        assert!(page.iter().all(|&b| b == 0x42));
        assert!(cache.pages.is_dirty(cache.pages.deref(page.slot())));
        drop(page);

        swapper.set_fail_writes(false);
        let page = cache
            .acquire(file_id, PageId::new(1), PageIntent::Read)
            .unwrap();
        assert_eq!(page.slot(), 0);
        drop(page);
        assert!(
            swapper
                .page(PageId::new(0))
                .unwrap()
                .iter()
                .all(|&b| b == 0x42)
        );
    }

    #[test]
    fn close_busy_file() {
        let cache = cache(4);
        let file_id = cache
            .open_file(Arc::new(MemorySwapper::new(PAGE_SIZE)))
            .unwrap();
        let page = cache
            .acquire(file_id, PageId::new(0), PageIntent::Read)
            .unwrap();

        assert!(matches!(
            cache.close_file(file_id),
            Err(PageCacheError::FileBusy(id)) if id == file_id
        ));
        // closed for new pages, cached ones included
        assert!(matches!(
            cache.acquire(file_id, PageId::new(1), PageIntent::Read),
            Err(PageCacheError::Swapper(SwapperError::Stale(_)))
        ));
        assert!(matches!(
            cache.acquire(file_id, PageId::new(0), PageIntent::Write),
            Err(PageCacheError::Swapper(SwapperError::Stale(_)))
        ));
        assert_eq!(cache.pages.usage_count(cache.pages.deref(page.slot())), 1);

        drop(page);
        assert_eq!(cache.vacuum().unwrap(), 1);
        assert_eq!(cache.free_slot_count(), 4);
        assert_eq!(cache.table.len(), 0);
    }

    #[test]
    fn close_while_holding_a_write_handle() {
        let cache = cache(4);
        let swapper = Arc::new(MemorySwapper::new(PAGE_SIZE));
        let file_id = cache.open_file(swapper.clone()).unwrap();
        let mut page = cache
            .acquire(file_id, PageId::new(0), PageIntent::Write)
            .unwrap();

        assert!(matches!(
            cache.close_file(file_id),
            Err(PageCacheError::FileBusy(id)) if id == file_id
        ));
        assert_eq!(swapper.writes(), 0);
        assert_eq!(swapper.forces(), 1);

        page.fill(0x77);
        drop(page);

        assert_eq!(cache.vacuum().unwrap(), 1);
        assert_eq!(swapper.writes(), 1);
        assert_eq!(swapper.forces(), 2);
        assert_eq!(swapper.page(PageId::new(0)).unwrap(), vec![0x77; PAGE_SIZE]);
        assert_eq!(cache.free_slot_count(), 4);
    }

    #[test]
    fn flush_skips_pages_held_for_writing() {
        let cache = cache(4);
        let swapper = Arc::new(MemorySwapper::new(PAGE_SIZE));
        let file_id = cache.open_file(swapper.clone()).unwrap();

        let mut held = cache
            .acquire(file_id, PageId::new(0), PageIntent::Write)
            .unwrap();
        let mut other = cache
            .acquire(file_id, PageId::new(1), PageIntent::Write)
            .unwrap();
        other.fill(1);
        drop(other);

        cache.flush_file(file_id).unwrap();
        cache.flush_all().unwrap();
        assert_eq!(swapper.writes(), 1);
        assert_eq!(swapper.page(PageId::new(0)), None);
        assert!(cache.pages.is_dirty(cache.pages.deref(held.slot())));

        held.fill(2);
        drop(held);
        cache.flush_file(file_id).unwrap();
        assert_eq!(swapper.page(PageId::new(0)).unwrap(), vec![2; PAGE_SIZE]);
    }

    #[test]
    fn drop_flushes() {
        let swapper = Arc::new(MemorySwapper::new(PAGE_SIZE));
        {
            let cache = cache(2);
            let file_id = cache.open_file(swapper.clone()).unwrap();
            let mut page = cache
                .acquire(file_id, PageId::new(7), PageIntent::Write)
                .unwrap();
            page[0] = 7;
        }
        assert_eq!(swapper.page(PageId::new(7)).unwrap()[0], 7);
    }
}
