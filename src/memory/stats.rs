//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., `used_bytes` may briefly lead `current_allocs`).
//! This is acceptable for diagnostic display. Do NOT use these values for
//! allocation decisions.

use crate::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `get()`, which
/// clamps negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed).max(0).cast_unsigned()
    }

    /// Add `val` and return the new value.
    #[inline]
    pub fn add_fetch(&self, val: usize) -> usize {
        let delta = Self::delta(val);
        self.0
            .fetch_add(delta, Ordering::Relaxed)
            .saturating_add(delta)
            .max(0)
            .cast_unsigned()
    }
}

/// A [`Counter`] that also remembers the highest value it has reached.
pub(crate) struct PeakCounter {
    current: Counter,
    peak: AtomicUsize,
}

impl PeakCounter {
    pub fn new() -> Self {
        Self {
            current: Counter::new(),
            peak: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn add(&self, val: usize) {
        let now = self.current.add_fetch(val);
        let mut seen = self.peak.load(Ordering::Relaxed);
        while now > seen {
            match self
                .peak
                .compare_exchange_weak(seen, now, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => seen = actual,
            }
        }
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.current.sub(val);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.current.get()
    }

    #[inline]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}

/// Live counters owned by one allocator instance.
pub(crate) struct AllocatorCounters {
    /// Bytes currently mapped for live pools and large allocations.
    /// Cached blocks are not included.
    pub os_bytes: PeakCounter,
    /// Mapped bytes callers cannot use: pool tail slack plus large
    /// allocation page rounding.
    pub waste_bytes: PeakCounter,
    /// Usable bytes handed out (block size for pooled, aligned request
    /// size for large).
    pub used_bytes: PeakCounter,
    pub current_allocs: Counter,
    pub total_allocs: Counter,
    pub os_reserve_calls: Counter,
    pub os_release_calls: Counter,
    pub cache_hits: Counter,
    pub cache_flushes: Counter,
}

impl AllocatorCounters {
    pub fn new() -> Self {
        Self {
            os_bytes: PeakCounter::new(),
            waste_bytes: PeakCounter::new(),
            used_bytes: PeakCounter::new(),
            current_allocs: Counter::new(),
            total_allocs: Counter::new(),
            os_reserve_calls: Counter::new(),
            os_release_calls: Counter::new(),
            cache_hits: Counter::new(),
            cache_flushes: Counter::new(),
        }
    }

    pub fn snapshot(&self, cached_blocks: usize, cached_bytes: usize) -> AllocatorStats {
        AllocatorStats {
            os_current: self.os_bytes.get(),
            os_peak: self.os_bytes.peak(),
            waste_current: self.waste_bytes.get(),
            waste_peak: self.waste_bytes.peak(),
            used_current: self.used_bytes.get(),
            used_peak: self.used_bytes.peak(),
            current_allocs: self.current_allocs.get(),
            total_allocs: self.total_allocs.get(),
            os_reserve_calls: self.os_reserve_calls.get(),
            os_release_calls: self.os_release_calls.get(),
            cache_hits: self.cache_hits.get(),
            cache_flushes: self.cache_flushes.get(),
            cached_blocks,
            cached_bytes,
        }
    }
}

/// Point-in-time accounting snapshot of one allocator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub os_current: usize,
    pub os_peak: usize,
    pub waste_current: usize,
    pub waste_peak: usize,
    pub used_current: usize,
    pub used_peak: usize,
    pub current_allocs: usize,
    pub total_allocs: usize,
    /// Calls that reached the OS page provider (cache hits excluded).
    pub os_reserve_calls: usize,
    pub os_release_calls: usize,
    pub cache_hits: usize,
    /// Times the whole free-block cache was dropped to retry a failed map.
    pub cache_flushes: usize,
    pub cached_blocks: usize,
    pub cached_bytes: usize,
}

// Process-wide totals across every allocator instance.
crate::sync::static_atomic! {
    pub static TOTAL_OS_BYTES: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static TOTAL_CACHED_BYTES: Counter = Counter::new();
}
