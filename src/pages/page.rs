/// Page size used when none is configured.
pub const DEFAULT_PAGE_SIZE: usize = 8192;

/// Highest page number a file can address. The binding word keeps 43 bits for it.
pub const MAX_PAGE_ID: u64 = (1 << 43) - 1;

/// The position of a page inside its file.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct PageId(u64);

impl PageId {
    pub const fn new(page_id: u64) -> Self {
        Self(page_id)
    }

    pub const fn get(&self) -> u64 {
        self.0
    }

    /// Byte offset of the page in a file of `page_size` pages.
    pub fn offset(&self, page_size: usize) -> u64 {
        self.0 * page_size as u64
    }

    pub fn is_addressable(&self) -> bool {
        self.0 <= MAX_PAGE_ID
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the caller intends to do with an acquired page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageIntent {
    /// shared access; the page is never marked dirty
    Read,
    /// exclusive access to the content; the page is marked dirty
    Write,
}

impl PageIntent {
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Write)
    }
}
