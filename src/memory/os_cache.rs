use super::stats;
use std::collections::VecDeque;
use std::ptr::NonNull;

/// One mapped OS block that was freed but not yet returned to the OS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CachedBlock {
    pub ptr: NonNull<u8>,
    pub bytes: usize,
}

/// Limits of the free-block cache.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CachePolicy {
    pub max_entries: usize,
    pub max_bytes: usize,
    pub max_block_size: usize,
    /// A cached block of `b` bytes serves a request of `s` bytes when
    /// `s <= b` and `b * reuse_den <= s * reuse_num`.
    pub reuse_num: usize,
    pub reuse_den: usize,
}

/// Result of offering a freed block to the cache.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Kept. `evicted` is the oldest entry pushed out to make room; the
    /// caller must release it to the OS.
    Cached { evicted: Option<CachedBlock> },
    /// Over budget or too large; the caller must release it.
    Rejected(CachedBlock),
}

/// Bounded FIFO of freed OS blocks.
///
/// Entries are kept oldest-first. Lookups scan newest-first so recently
/// touched memory is handed out again first. Both the entry count and the
/// byte total stay within [`CachePolicy`] after every insertion.
pub(crate) struct FreeBlockCache {
    entries: VecDeque<CachedBlock>,
    cached_bytes: usize,
    policy: CachePolicy,
}

// Safety: the cache exclusively owns the OS blocks it stores and is only
// reached through the allocator's AccessGuard.
unsafe impl Send for FreeBlockCache {}

impl FreeBlockCache {
    pub(crate) fn new(policy: CachePolicy) -> Self {
        Self {
            entries: VecDeque::with_capacity(policy.max_entries),
            cached_bytes: 0,
            policy,
        }
    }

    pub(crate) fn insert(&mut self, block: CachedBlock) -> Admission {
        let fits = self
            .cached_bytes
            .checked_add(block.bytes)
            .is_some_and(|total| total <= self.policy.max_bytes);
        if self.policy.max_entries == 0 || block.bytes > self.policy.max_block_size || !fits {
            return Admission::Rejected(block);
        }

        let evicted = if self.entries.len() >= self.policy.max_entries {
            self.pop_oldest()
        } else {
            None
        };

        self.entries.push_back(block);
        self.cached_bytes += block.bytes;
        stats::TOTAL_CACHED_BYTES.add(block.bytes);
        log::trace!(
            "[binned] cached {} bytes at {:p} ({} entries, {} bytes)",
            block.bytes,
            block.ptr,
            self.entries.len(),
            self.cached_bytes
        );
        Admission::Cached { evicted }
    }

    /// Remove and return a block able to serve `size` bytes.
    pub(crate) fn take(&mut self, size: usize) -> Option<CachedBlock> {
        let limit = size.saturating_mul(self.policy.reuse_num);
        let pos = self
            .entries
            .iter()
            .rposition(|b| b.bytes >= size && b.bytes.saturating_mul(self.policy.reuse_den) <= limit)?;
        let block = self.entries.remove(pos)?;
        self.cached_bytes -= block.bytes;
        stats::TOTAL_CACHED_BYTES.sub(block.bytes);
        Some(block)
    }

    fn pop_oldest(&mut self) -> Option<CachedBlock> {
        let block = self.entries.pop_front()?;
        self.cached_bytes -= block.bytes;
        stats::TOTAL_CACHED_BYTES.sub(block.bytes);
        log::trace!("[binned] evicted cached block {:p} ({} bytes)", block.ptr, block.bytes);
        Some(block)
    }

    /// Empty the cache, oldest first. The caller releases every block.
    pub(crate) fn drain(&mut self) -> Vec<CachedBlock> {
        stats::TOTAL_CACHED_BYTES.sub(self.cached_bytes);
        self.cached_bytes = 0;
        self.entries.drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn cached_bytes(&self) -> usize {
        self.cached_bytes
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.entries.iter().any(|b| b.ptr == ptr)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn policy() -> CachePolicy {
        CachePolicy {
            max_entries: 4,
            max_bytes: 256 * 1024,
            max_block_size: 64 * 1024,
            reuse_num: 4,
            reuse_den: 3,
        }
    }

    /// Fake, never-dereferenced addresses.
    fn block(id: usize, bytes: usize) -> CachedBlock {
        CachedBlock {
            ptr: NonNull::new((id * 0x10_0000) as *mut u8).unwrap(),
            bytes,
        }
    }

    #[test]
    fn test_cache_reuse_exact() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut cache = FreeBlockCache::new(policy());
        assert_eq!(cache.insert(block(1, 65536)), Admission::Cached { evicted: None });
        assert_eq!(cache.take(65536), Some(block(1, 65536)));
        assert!(cache.is_empty());
        assert_eq!(cache.cached_bytes(), 0);
    }

    #[test]
    fn test_cache_reuse_window() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut cache = FreeBlockCache::new(policy());
        cache.insert(block(1, 65536));
        // 65536 * 3 <= 49152 * 4: exactly at the 4/3 bound.
        assert_eq!(cache.take(49152), Some(block(1, 65536)));

        cache.insert(block(2, 65536));
        // 49148 leaves more than a third of slack.
        assert_eq!(cache.take(49148), None);
        // Too small for the request.
        assert_eq!(cache.take(65537), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_prefers_newest_match() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut cache = FreeBlockCache::new(policy());
        cache.insert(block(1, 16384));
        cache.insert(block(2, 16384));
        assert_eq!(cache.take(16384), Some(block(2, 16384)));
        assert_eq!(cache.take(16384), Some(block(1, 16384)));
    }

    #[test]
    fn test_cache_evicts_oldest_at_entry_limit() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut cache = FreeBlockCache::new(policy());
        for id in 1..=4 {
            cache.insert(block(id, 4096));
        }
        assert_eq!(
            cache.insert(block(5, 4096)),
            Admission::Cached { evicted: Some(block(1, 4096)) }
        );
        assert_eq!(cache.len(), 4);
        assert!(!cache.contains(block(1, 4096).ptr));
        assert!(cache.contains(block(5, 4096).ptr));
    }

    #[test]
    fn test_cache_rejects_oversized_and_over_budget() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut cache = FreeBlockCache::new(CachePolicy {
            max_bytes: 96 * 1024,
            ..policy()
        });
        assert_eq!(cache.insert(block(1, 128 * 1024)), Admission::Rejected(block(1, 128 * 1024)));
        cache.insert(block(2, 64 * 1024));
        assert_eq!(cache.insert(block(3, 64 * 1024)), Admission::Rejected(block(3, 64 * 1024)));
        assert_eq!(cache.cached_bytes(), 64 * 1024);
    }

    #[test]
    fn test_cache_disabled_with_zero_entries() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut cache = FreeBlockCache::new(CachePolicy {
            max_entries: 0,
            ..policy()
        });
        assert_eq!(cache.insert(block(1, 4096)), Admission::Rejected(block(1, 4096)));
    }

    #[test]
    fn test_cache_bounds_hold_after_every_insert() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let p = policy();
        let mut cache = FreeBlockCache::new(p);
        let sizes = [4096, 65536, 8192, 65536, 12288, 65536, 65536, 4096, 32768, 65536];
        for (id, &bytes) in sizes.iter().cycle().take(40).enumerate() {
            cache.insert(block(id + 1, bytes));
            assert!(cache.len() <= p.max_entries);
            assert!(cache.cached_bytes() <= p.max_bytes);
            let sum: usize = cache.entries.iter().map(|b| b.bytes).sum();
            assert_eq!(sum, cache.cached_bytes());
        }
    }

    #[test]
    fn test_cache_drain_empties() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut cache = FreeBlockCache::new(policy());
        cache.insert(block(1, 4096));
        cache.insert(block(2, 8192));
        let drained = cache.drain();
        assert_eq!(drained, vec![block(1, 4096), block(2, 8192)]);
        assert!(cache.is_empty());
        assert_eq!(cache.cached_bytes(), 0);
    }
}
