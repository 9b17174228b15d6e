use crate::cache::pagelist::PageList;

use std::sync::atomic::{AtomicUsize, Ordering};

/// Clock replacement over the page list, with one referenced bit per slot.
///
/// Every pin sets the slot's referenced bit. The hand sweeps the slots: pinned
/// or locked slots are skipped, referenced ones lose their bit and get a second
/// chance, and the first unreferenced, unpinned, bound slot is exclusively
/// locked and returned. Free slots are left to the free list.
///
/// A search reserves a start position on the shared hand and sweeps two
/// revolutions from it on its own, so concurrent searches never split the
/// slots between them. By then every slot has been offered a second chance,
/// so failing means every slot was pinned, or busy, for the whole sweep.
pub struct ClockSweep {
    hand: AtomicUsize,
}

impl Default for ClockSweep {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSweep {
    pub fn new() -> Self {
        Self {
            hand: AtomicUsize::new(0),
        }
    }

    /// Position of the next slot the hand looks at, not wrapped.
    pub fn hand(&self) -> usize {
        self.hand.load(Ordering::Relaxed)
    }

    /// Finds a slot to evict and returns it exclusively locked.
    pub fn find_victim(&self, pages: &PageList) -> Option<usize> {
        let page_count = pages.page_count();
        let start = self.hand.fetch_add(1, Ordering::Relaxed);
        let end = start.wrapping_add(2 * page_count);

        let mut position = start;
        while position != end {
            let slot = position % page_count;
            position = position.wrapping_add(1);
            let page_ref = pages.deref(slot);

            if pages.usage_count(page_ref) > 0 || pages.is_exclusive(page_ref) {
                continue;
            }
            if pages.try_clear_referenced(page_ref) {
                continue;
            }
            if !pages.try_exclusive_lock(page_ref) {
                continue;
            }
            if pages.binding(page_ref).is_none() {
                // free slots belong to the free list
                pages.unlock_exclusive(page_ref);
                continue;
            }
            self.hand.store(position, Ordering::Relaxed);
            return Some(slot);
        }

        self.hand.store(end, Ordering::Relaxed);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::victim::VictimPage;
    use crate::mem::{MemoryAllocator, MemoryTracker};
    use crate::pages::PageId;
    use crate::storage::FileId;

    use std::sync::Arc;

    fn bound_list(pages: usize) -> (PageList, VictimPage) {
        let memory = Arc::new(MemoryAllocator::new(Arc::new(MemoryTracker::unbounded())));
        let victim = VictimPage::new(512, &memory).unwrap();
        let list = PageList::new(pages, 512, &memory, &victim, 512).unwrap();
        for slot in 0..pages {
            let page_ref = list.deref(slot);
            assert!(list.try_exclusive_lock(page_ref));
            list.bind(page_ref, FileId(1), PageId::new(slot as u64));
            list.restore_buffer(page_ref);
            // pinned once then released: referenced
            list.unlock_exclusive_to_pinned(page_ref);
            list.decrement_usage(page_ref);
        }
        (list, victim)
    }

    #[test]
    fn second_chance() {
        let (list, _victim) = bound_list(4);
        let clock = ClockSweep::new();

        // all slots referenced: first revolution clears the bits
        assert_eq!(clock.find_victim(&list), Some(0));
        assert_eq!(clock.hand(), 5);
        list.unlock_exclusive(list.deref(0));

        // slot 1 was used again since the sweep
        list.increment_usage(list.deref(1)).unwrap();
        list.decrement_usage(list.deref(1));
        assert_eq!(clock.find_victim(&list), Some(2));
    }

    #[test]
    fn skips_pinned_slots() {
        let (list, _victim) = bound_list(4);
        let clock = ClockSweep::new();
        for slot in [0, 1, 3] {
            list.increment_usage(list.deref(slot)).unwrap();
        }
        assert_eq!(clock.find_victim(&list), Some(2));
        assert!(list.is_exclusive(list.deref(2)));
    }

    #[test]
    fn gives_up_when_everything_is_pinned() {
        let (list, _victim) = bound_list(4);
        let clock = ClockSweep::new();
        for slot in 0..4 {
            list.increment_usage(list.deref(slot)).unwrap();
        }
        assert_eq!(clock.find_victim(&list), None);
        assert_eq!(clock.hand(), 8);
    }

    #[test]
    fn concurrent_searches_cover_every_slot() {
        let (list, _victim) = bound_list(64);
        let clock = ClockSweep::new();
        let evictable = [13, 30, 47, 62];
        for slot in 0..64 {
            if !evictable.contains(&slot) {
                list.increment_usage(list.deref(slot)).unwrap();
            }
        }

        std::thread::scope(|s| {
            for _ in 0..3 {
                s.spawn(|| {
                    for _ in 0..2000 {
                        let slot = clock.find_victim(&list).unwrap();
                        assert!(evictable.contains(&slot));
                        list.unlock_exclusive(list.deref(slot));
                    }
                });
            }
        });
    }

    #[test]
    fn leaves_free_slots_alone() {
        let memory = Arc::new(MemoryAllocator::new(Arc::new(MemoryTracker::unbounded())));
        let victim = VictimPage::new(512, &memory).unwrap();
        let list = PageList::new(4, 512, &memory, &victim, 512).unwrap();
        let clock = ClockSweep::new();
        assert_eq!(clock.find_victim(&list), None);
        for slot in 0..4 {
            assert!(!list.is_exclusive(list.deref(slot)));
        }
    }
}
