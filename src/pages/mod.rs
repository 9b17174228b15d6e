mod page;

pub use page::{DEFAULT_PAGE_SIZE, MAX_PAGE_ID, PageId, PageIntent};
