use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

/// Event counters of a page cache.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub hits: AtomicU64,
    pub faults: AtomicU64,
    pub evictions: AtomicU64,
    pub flushes: AtomicU64,
    pub eviction_failures: AtomicU64,
}

impl Counters {
    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn eviction_failure(&self) {
        self.eviction_failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Aggregate counters of a page cache at one point in time, for metrics
/// collectors. Individual slots are never exposed.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheStats {
    pub taken_at: DateTime<Utc>,
    pub slot_count: usize,
    pub free_slots: usize,
    pub page_size: usize,
    pub cache_size: usize,
    pub open_files: usize,
    /// off-heap bytes held by the cache: records, victim page and buffers
    pub memory_used: usize,
    pub hits: u64,
    pub faults: u64,
    pub evictions: u64,
    pub flushes: u64,
    pub eviction_failures: u64,
}

impl CacheStats {
    /// Share of acquisitions served without a fault.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.faults;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
