mod clock;
mod pagecache;
mod pagelist;
mod stats;
mod swappers;
mod table;
mod victim;

pub use clock::ClockSweep;
pub use pagecache::{PageCache, PageCacheError, PageHandle};
pub use pagelist::{MAX_FILE_ID, MAX_USAGE_COUNT, PageList, PageListError, PageRef, RECORD_SIZE};
pub use stats::CacheStats;
pub use swappers::{FreedSwappers, SwapperError, SwapperSet};
pub use victim::VictimPage;
