use crate::cache::pagelist::MAX_FILE_ID;
use crate::storage::{FileId, PageSwapper};

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum SwapperError {
    #[error("file id {0} is out of range")]
    OutOfRange(FileId),
    #[error("file id {0} is not allocated")]
    NotFound(FileId),
    #[error("file id {0} was released")]
    Stale(FileId),
    #[error("all {0} file ids are in use")]
    Exhausted(u32),
}

enum Entry {
    Vacant,
    Live(Arc<dyn PageSwapper>),
    /// released, but slots may still hold pages of the file
    Freed(Arc<dyn PageSwapper>),
}

struct Swappers {
    entries: Vec<Entry>,
    /// vacant ids below `entries.len()`, ready to be reissued
    free: BTreeSet<u32>,
    /// released ids waiting for a vacuum
    freed: Vec<u32>,
}

/// The swapper registry: maps the file ids stored in slot bindings to the
/// swappers of the open files.
///
/// A released id is not reissued right away. It stays tombstoned until
/// [`SwapperSet::vacuum`] has made sure no slot still holds a page tagged with
/// it, otherwise a new file could inherit the pages of the old one.
pub struct SwapperSet {
    max_id: u32,
    inner: RwLock<Swappers>,
}

/// Pairs of released ids and their swappers, as handed to a vacuum.
pub type FreedSwappers = [(FileId, Arc<dyn PageSwapper>)];

impl Default for SwapperSet {
    fn default() -> Self {
        Self::new()
    }
}

impl SwapperSet {
    pub fn new() -> Self {
        Self::with_max_id(MAX_FILE_ID)
    }

    pub fn with_max_id(max_id: u32) -> Self {
        assert!(
            (1..=MAX_FILE_ID).contains(&max_id),
            "max file id {max_id} out of range"
        );
        let mut entries = Vec::with_capacity(16);
        // id 0 marks unbound slots
        entries.push(Entry::Vacant);
        Self {
            max_id,
            inner: RwLock::new(Swappers {
                entries,
                free: BTreeSet::new(),
                freed: Vec::new(),
            }),
        }
    }

    pub fn max_id(&self) -> u32 {
        self.max_id
    }

    /// Registers `swapper` under the smallest reusable id.
    pub fn allocate(&self, swapper: Arc<dyn PageSwapper>) -> Result<FileId, SwapperError> {
        let mut inner = self.inner.write();

        if let Some(id) = inner.free.pop_first() {
            inner.entries[id as usize] = Entry::Live(swapper);
            return Ok(FileId(id));
        }

        let id = inner.entries.len() as u32;
        if id > self.max_id {
            return Err(SwapperError::Exhausted(self.max_id));
        }
        if inner.entries.len() == inner.entries.capacity() {
            let additional = inner.entries.len();
            inner.entries.reserve_exact(additional);
        }
        inner.entries.push(Entry::Live(swapper));

        Ok(FileId(id))
    }

    /// Releases `file_id`. Lookups fail with [`SwapperError::Stale`] until a
    /// vacuum makes the id reusable.
    pub fn free(&self, file_id: FileId) -> Result<(), SwapperError> {
        self.check_range(file_id)?;
        let mut inner = self.inner.write();
        let entry = inner
            .entries
            .get_mut(file_id.get() as usize)
            .ok_or(SwapperError::NotFound(file_id))?;

        match std::mem::replace(entry, Entry::Vacant) {
            Entry::Live(swapper) => {
                *entry = Entry::Freed(swapper);
                inner.freed.push(file_id.get());
                Ok(())
            }
            Entry::Freed(swapper) => {
                *entry = Entry::Freed(swapper);
                Err(SwapperError::Stale(file_id))
            }
            Entry::Vacant => Err(SwapperError::NotFound(file_id)),
        }
    }

    /// The swapper of an open file.
    pub fn swapper_for(&self, file_id: FileId) -> Result<Arc<dyn PageSwapper>, SwapperError> {
        self.check_range(file_id)?;
        let inner = self.inner.read();
        match inner.entries.get(file_id.get() as usize) {
            Some(Entry::Live(swapper)) => Ok(Arc::clone(swapper)),
            Some(Entry::Freed(_)) => Err(SwapperError::Stale(file_id)),
            Some(Entry::Vacant) | None => Err(SwapperError::NotFound(file_id)),
        }
    }

    /// Like [`SwapperSet::swapper_for`], but also returns the swappers of
    /// released files, whose dirty pages must still reach storage.
    pub(crate) fn swapper_for_eviction(
        &self,
        file_id: FileId,
    ) -> Result<Arc<dyn PageSwapper>, SwapperError> {
        self.check_range(file_id)?;
        let inner = self.inner.read();
        match inner.entries.get(file_id.get() as usize) {
            Some(Entry::Live(swapper) | Entry::Freed(swapper)) => Ok(Arc::clone(swapper)),
            Some(Entry::Vacant) | None => Err(SwapperError::NotFound(file_id)),
        }
    }

    /// Swappers of all open files.
    pub fn live(&self) -> Vec<(FileId, Arc<dyn PageSwapper>)> {
        let inner = self.inner.read();
        inner
            .entries
            .iter()
            .enumerate()
            .filter_map(|(id, entry)| match entry {
                Entry::Live(swapper) => Some((FileId(id as u32), Arc::clone(swapper))),
                _ => None,
            })
            .collect()
    }

    pub fn live_count(&self) -> usize {
        let inner = self.inner.read();
        inner
            .entries
            .iter()
            .filter(|entry| matches!(entry, Entry::Live(_)))
            .count()
    }

    pub fn freed_count(&self) -> usize {
        self.inner.read().freed.len()
    }

    /// Makes released ids reusable.
    ///
    /// `evict` receives every released id with its swapper and must remove all
    /// pages of those files from the cache. If it fails, the ids stay released
    /// and the next vacuum tries again. Returns the number of ids recycled.
    pub fn vacuum<E>(
        &self,
        evict: impl FnOnce(&FreedSwappers) -> Result<(), E>,
    ) -> Result<usize, E> {
        let freed: Vec<_> = {
            let inner = self.inner.read();
            inner
                .freed
                .iter()
                .filter_map(|&id| match &inner.entries[id as usize] {
                    Entry::Freed(swapper) => Some((FileId(id), Arc::clone(swapper))),
                    _ => None,
                })
                .collect()
        };
        if freed.is_empty() {
            return Ok(0);
        }

        evict(&freed)?;

        let mut inner = self.inner.write();
        let mut recycled = 0;
        for (file_id, _) in &freed {
            let id = file_id.get();
            // a concurrent vacuum may have been faster
            if matches!(inner.entries[id as usize], Entry::Freed(_)) {
                inner.entries[id as usize] = Entry::Vacant;
                inner.freed.retain(|&freed_id| freed_id != id);
                inner.free.insert(id);
                recycled += 1;
            }
        }
        log::debug!("vacuumed {recycled} file ids");

        Ok(recycled)
    }

    fn check_range(&self, file_id: FileId) -> Result<(), SwapperError> {
        if file_id.is_none() || file_id.get() > self.max_id {
            return Err(SwapperError::OutOfRange(file_id));
        }
        Ok(())
    }
}
