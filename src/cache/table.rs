use crate::pages::PageId;
use crate::storage::FileId;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct PageKey {
    pub file_id: FileId,
    pub page_id: PageId,
}

impl PageKey {
    pub fn new(file_id: FileId, page_id: PageId) -> Self {
        Self { file_id, page_id }
    }
}

/// Where a page lives, or the latch to wait on while it is being faulted in.
#[derive(Clone)]
pub(crate) enum Mapping {
    Loaded(usize),
    Faulting(Arc<FaultLatch>),
}

/// Parks the threads that want a page another thread is faulting in.
pub(crate) struct FaultLatch {
    done: Mutex<bool>,
    cond: Condvar,
}

impl FaultLatch {
    pub fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }

    pub fn open(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }
}

pub(crate) type Shard = HashMap<PageKey, Mapping>;

/// Maps the pages in the cache to their slots.
///
/// The map is split in shards so that lookups on unrelated pages rarely meet
/// on the same mutex. Shard locks are held for map operations and pin
/// attempts only, never across I/O.
pub(crate) struct TranslationTable {
    shards: Box<[Mutex<Shard>]>,
}

impl TranslationTable {
    pub fn new(shards: usize) -> Self {
        assert!(shards > 0);
        let shards = std::iter::repeat_with(|| Mutex::new(HashMap::new())).take(shards);
        Self {
            shards: Box::from_iter(shards),
        }
    }

    pub fn lock(&self, key: &PageKey) -> MutexGuard<'_, Shard> {
        self.shards[self.shard_index(key)].lock()
    }

    fn shard_index(&self, key: &PageKey) -> usize {
        let mixed = (key.page_id.get() ^ ((key.file_id.get() as u64) << 43))
            .wrapping_mul(0x9E37_79B9_7F4A_7C15);
        (mixed >> 32) as usize % self.shards.len()
    }

    /// Removes the mapping of `key` if it still points at `slot`.
    pub fn remove_loaded(&self, key: &PageKey, slot: usize) -> bool {
        let mut shard = self.lock(key);
        match shard.get(key) {
            Some(Mapping::Loaded(loaded)) if *loaded == slot => {
                shard.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Copies out the entries of the files matching `filter`, one shard at a time.
    pub fn entries_of(&self, filter: impl Fn(FileId) -> bool) -> Vec<(PageKey, Mapping)> {
        let mut entries = Vec::new();
        for shard in self.shards.iter() {
            let shard = shard.lock();
            entries.extend(
                shard
                    .iter()
                    .filter(|(key, _)| filter(key.file_id))
                    .map(|(key, mapping)| (*key, mapping.clone())),
            );
        }
        entries
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }
}
