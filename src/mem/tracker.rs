use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
#[error("memory limit exceeded: requested {requested} bytes, {available} of {limit} available")]
pub struct LimitExceeded {
    pub requested: usize,
    pub available: usize,
    pub limit: usize,
}

/// Accounts for native memory handed out by a [`MemoryAllocator`].
///
/// A tracker is shared by reference (usually an `Arc`) between the allocators
/// drawing from the same budget. Reservations are all-or-nothing: a request that
/// would exceed the limit is refused and leaves the counters untouched.
///
/// [`MemoryAllocator`]: crate::mem::MemoryAllocator
#[derive(Debug)]
pub struct MemoryTracker {
    limit: Option<usize>,
    used: AtomicUsize,
    peak: AtomicUsize,
    allocations: AtomicU64,
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl MemoryTracker {
    pub fn unbounded() -> Self {
        Self {
            limit: None,
            used: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            allocations: AtomicU64::new(0),
        }
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::unbounded()
        }
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Bytes currently reserved.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Highest value [`MemoryTracker::used`] ever reached.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// Number of successful reservations.
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Bytes that can still be reserved.
    pub fn available(&self) -> usize {
        match self.limit {
            Some(limit) => limit.saturating_sub(self.used()),
            None => usize::MAX - self.used(),
        }
    }

    pub fn reserve(&self, bytes: usize) -> Result<(), LimitExceeded> {
        let limit = self.limit.unwrap_or(usize::MAX);
        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            let new = match used.checked_add(bytes) {
                Some(new) if new <= limit => new,
                _ => {
                    return Err(LimitExceeded {
                        requested: bytes,
                        available: limit.saturating_sub(used),
                        limit,
                    });
                }
            };
            match self
                .used
                .compare_exchange_weak(used, new, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    self.peak.fetch_max(new, Ordering::Relaxed);
                    self.allocations.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(current) => used = current,
            }
        }
    }

    pub fn release(&self, bytes: usize) {
        let previous = self.used.fetch_sub(bytes, Ordering::AcqRel);
        assert!(
            previous >= bytes,
            "released {bytes} bytes but only {previous} were reserved"
        );
    }
}
