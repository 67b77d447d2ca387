use super::free_list::FreeList;
use super::indirect::PoolHandle;
use super::size_class::TableLayout;
#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;
use std::fmt;
use std::ptr::NonNull;

/// Which of its table's two lists a pool is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PoolList {
    /// Has at least one free block.
    Partial,
    /// Every block is live.
    Exhausted,
}

/// One OS slab carved into equal blocks.
pub(crate) struct Pool {
    base: NonNull<u8>,
    blocks: u32,
    taken: u32,
    os_bytes: usize,
    free: FreeList,
    list: PoolList,
    prev: Option<u32>,
    next: Option<u32>,
    /// Blocks currently handed out. Catches double frees in debug builds.
    #[cfg(debug_assertions)]
    live: FixedBitSet,
}

impl Pool {
    #[inline]
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[cfg(test)]
    pub(crate) fn blocks_taken(&self) -> u32 {
        self.taken
    }

    #[inline]
    pub(crate) fn os_bytes(&self) -> usize {
        self.os_bytes
    }
}

/// OS block of a pool that just lost its last live block. The caller hands it
/// to the free-block cache or releases it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RetiredPool {
    pub base: NonNull<u8>,
    pub os_bytes: usize,
}

/// Per-table request accounting, reported by `dump_allocations`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct TableStats {
    pub active_pools: usize,
    pub max_active_pools: usize,
    pub active_requests: usize,
    pub max_active_requests: usize,
    pub min_request: usize,
    pub max_request: usize,
    pub total_requests: u64,
    /// Sum of `block_size - request` over every request served.
    pub total_waste: u64,
}

impl TableStats {
    fn record_alloc(&mut self, request: usize, block_size: usize) {
        self.total_requests += 1;
        self.active_requests += 1;
        self.max_active_requests = self.max_active_requests.max(self.active_requests);
        self.min_request = if self.total_requests == 1 {
            request
        } else {
            self.min_request.min(request)
        };
        self.max_request = self.max_request.max(request);
        self.total_waste += block_size.saturating_sub(request) as u64;
    }
}

/// Memory footprint of one table, in bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct TableUsage {
    /// Slabs held by live pools.
    pub allocated: usize,
    /// Blocks handed out.
    pub used: usize,
    /// Free blocks ready for future requests.
    pub slack: usize,
    /// Estimated rounding loss of live requests plus the unusable slab tails.
    pub waste: usize,
}

impl TableUsage {
    /// Share of the allocated bytes not lost to waste, in percent.
    pub(crate) fn efficiency(&self) -> f64 {
        if self.allocated == 0 {
            return 100.0;
        }
        self.allocated.saturating_sub(self.waste) as f64 * 100.0 / self.allocated as f64
    }
}

/// Invariant violation found by [`PoolTable::check`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum HeapViolation {
    BrokenLink { table: u16, pool: u32 },
    WrongList { table: u16, pool: u32 },
    PartialWithoutFree { table: u16, pool: u32 },
    ExhaustedWithFree { table: u16, pool: u32 },
    EmptyRun { table: u16, pool: u32, run: usize },
    RunOutOfBounds { table: u16, pool: u32, run: usize },
    Accounting { table: u16, pool: u32, taken: u32, free: u64, blocks: u32 },
    Unlisted { table: u16, pools: usize, listed: usize },
    Unregistered { table: u16, pool: u32 },
}

impl fmt::Display for HeapViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BrokenLink { table, pool } => {
                write!(f, "table {table} pool {pool}: list links are inconsistent")
            }
            Self::WrongList { table, pool } => {
                write!(f, "table {table} pool {pool}: pool is tagged for the other list")
            }
            Self::PartialWithoutFree { table, pool } => {
                write!(f, "table {table} pool {pool}: partial pool has no free block")
            }
            Self::ExhaustedWithFree { table, pool } => {
                write!(f, "table {table} pool {pool}: exhausted pool still has free blocks")
            }
            Self::EmptyRun { table, pool, run } => {
                write!(f, "table {table} pool {pool}: free run at {run:#x} has zero count")
            }
            Self::RunOutOfBounds { table, pool, run } => {
                write!(f, "table {table} pool {pool}: free run at {run:#x} lies outside the slab")
            }
            Self::Accounting { table, pool, taken, free, blocks } => write!(
                f,
                "table {table} pool {pool}: {taken} taken + {free} free != {blocks} blocks"
            ),
            Self::Unlisted { table, pools, listed } => {
                write!(f, "table {table}: {pools} live pools but {listed} on the lists")
            }
            Self::Unregistered { table, pool } => {
                write!(f, "table {table} pool {pool}: slab does not resolve back to the pool")
            }
        }
    }
}

/// Every pool of one size class.
///
/// Pools live in an arena indexed by `u32`; the partial and exhausted lists
/// are doubly linked through those indices. Arena slots of destroyed pools
/// are reused by the next pool.
pub(crate) struct PoolTable {
    id: u16,
    block_size: usize,
    slab_bytes: usize,
    arena: Vec<Option<Pool>>,
    vacant: Vec<u32>,
    partial: Option<u32>,
    exhausted: Option<u32>,
    stats: TableStats,
}

// Safety: pools own their slabs exclusively; a table is only reached through
// its mutex.
unsafe impl Send for PoolTable {}

impl PoolTable {
    pub(crate) fn new(id: u16, layout: TableLayout) -> Self {
        debug_assert!(layout.slab_bytes >= layout.block_size);
        Self {
            id,
            block_size: layout.block_size,
            slab_bytes: layout.slab_bytes,
            arena: Vec::new(),
            vacant: Vec::new(),
            partial: None,
            exhausted: None,
            stats: TableStats::default(),
        }
    }

    #[inline]
    pub(crate) fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub(crate) fn slab_bytes(&self) -> usize {
        self.slab_bytes
    }

    #[inline]
    pub(crate) fn blocks_per_pool(&self) -> u32 {
        u32::try_from(self.slab_bytes / self.block_size).unwrap_or(u32::MAX)
    }

    /// Usable bytes of one pool.
    #[inline]
    pub(crate) fn allocated_bytes(&self) -> usize {
        self.blocks_per_pool() as usize * self.block_size
    }

    #[inline]
    pub(crate) fn has_partial(&self) -> bool {
        self.partial.is_some()
    }

    pub(crate) fn stats(&self) -> TableStats {
        self.stats
    }

    #[inline]
    fn pool_ref(&self, index: u32) -> &Pool {
        match self.arena.get(index as usize) {
            Some(Some(pool)) => pool,
            _ => panic!("pool table {}: no live pool at index {index}", self.id),
        }
    }

    #[inline]
    fn pool_mut(&mut self, index: u32) -> &mut Pool {
        let id = self.id;
        match self.arena.get_mut(index as usize) {
            Some(Some(pool)) => pool,
            _ => panic!("pool table {id}: no live pool at index {index}"),
        }
    }

    #[cfg(test)]
    pub(crate) fn pool(&self, handle: PoolHandle) -> Option<&Pool> {
        debug_assert_eq!(handle.table, self.id);
        self.arena.get(handle.index as usize)?.as_ref()
    }

    fn head_mut(&mut self, list: PoolList) -> &mut Option<u32> {
        match list {
            PoolList::Partial => &mut self.partial,
            PoolList::Exhausted => &mut self.exhausted,
        }
    }

    fn link_front(&mut self, index: u32, list: PoolList) {
        let old_head = *self.head_mut(list);
        let pool = self.pool_mut(index);
        pool.list = list;
        pool.prev = None;
        pool.next = old_head;
        if let Some(old) = old_head {
            self.pool_mut(old).prev = Some(index);
        }
        *self.head_mut(list) = Some(index);
    }

    fn unlink(&mut self, index: u32) {
        let (prev, next, list) = {
            let pool = self.pool_ref(index);
            (pool.prev, pool.next, pool.list)
        };
        match prev {
            Some(p) => self.pool_mut(p).next = next,
            None => *self.head_mut(list) = next,
        }
        if let Some(n) = next {
            self.pool_mut(n).prev = prev;
        }
        let pool = self.pool_mut(index);
        pool.prev = None;
        pool.next = None;
    }

    /// Index the next pool will get. The slab must be registered in the
    /// lookup table under this handle before [`insert_pool`](Self::insert_pool).
    pub(crate) fn next_handle(&self) -> PoolHandle {
        #[allow(clippy::cast_possible_truncation)]
        let index = self.vacant.last().copied().unwrap_or(self.arena.len() as u32);
        PoolHandle { table: self.id, index }
    }

    /// Adopt a freshly mapped slab as a new partial pool.
    ///
    /// # Safety
    /// `base` must be valid for `os_bytes` bytes, aligned to the page size,
    /// and not referenced by anything else.
    pub(crate) unsafe fn insert_pool(&mut self, base: NonNull<u8>, os_bytes: usize) -> PoolHandle {
        let blocks = self.blocks_per_pool();
        debug_assert!(os_bytes >= self.allocated_bytes());
        let pool = Pool {
            base,
            blocks,
            taken: 0,
            os_bytes,
            // Safety: the whole slab is unused memory (caller contract).
            free: unsafe { FreeList::with_run(base, blocks) },
            list: PoolList::Partial,
            prev: None,
            next: None,
            #[cfg(debug_assertions)]
            live: FixedBitSet::with_capacity(blocks as usize),
        };

        let handle = self.next_handle();
        if self.vacant.pop().is_some() {
            self.arena[handle.index as usize] = Some(pool);
        } else {
            self.arena.push(Some(pool));
        }
        self.link_front(handle.index, PoolList::Partial);

        self.stats.active_pools += 1;
        self.stats.max_active_pools = self.stats.max_active_pools.max(self.stats.active_pools);
        handle
    }

    /// Take one block from the first partial pool, or `None` when no pool has
    /// a free block. `request` is the normalized size, for accounting only.
    pub(crate) fn alloc_block(&mut self, request: usize) -> Option<NonNull<u8>> {
        let index = self.partial?;
        let block_size = self.block_size;
        #[cfg(debug_assertions)]
        let id = self.id;
        let pool = self.pool_mut(index);

        // Safety: the pool's free list was built by insert_pool with this
        // block size and only ever fed blocks of this pool.
        let block = unsafe { pool.free.pop(block_size) }?;
        pool.taken += 1;

        #[cfg(debug_assertions)]
        {
            let slot = (block.as_ptr() as usize - pool.base.as_ptr() as usize) / block_size;
            assert!(
                !pool.live.contains(slot),
                "free list of table {id} handed out live block {block:p}"
            );
            pool.live.insert(slot);
        }

        if pool.free.is_empty() {
            self.unlink(index);
            self.link_front(index, PoolList::Exhausted);
        }

        self.stats.record_alloc(request, block_size);
        Some(block)
    }

    /// Return `ptr` to pool `index`. Yields the slab when the pool has no live
    /// blocks left; the pool is then gone from the table.
    ///
    /// # Safety
    /// `ptr` must be a live block handed out by [`alloc_block`](Self::alloc_block)
    /// from that pool.
    pub(crate) unsafe fn free_block(&mut self, index: u32, ptr: NonNull<u8>) -> Option<RetiredPool> {
        let block_size = self.block_size;
        let allocated = self.allocated_bytes();
        let id = self.id;
        let pool = self.pool_mut(index);

        let offset = (ptr.as_ptr() as usize).wrapping_sub(pool.base.as_ptr() as usize);
        debug_assert!(
            offset < allocated && offset.is_multiple_of(block_size),
            "pointer {ptr:p} is not a block of table {id} pool {index}"
        );
        #[cfg(debug_assertions)]
        {
            let slot = offset / block_size;
            assert!(
                pool.live.contains(slot),
                "Double free detected in table {id} pool {index}: {ptr:p}"
            );
            pool.live.set(slot, false);
        }

        let was_exhausted = pool.list == PoolList::Exhausted;
        // Safety: ptr is a live block of this pool (caller contract) and is
        // now unused.
        unsafe { pool.free.push(ptr) };
        pool.taken -= 1;
        let now_idle = pool.taken == 0;
        self.stats.active_requests = self.stats.active_requests.saturating_sub(1);

        if was_exhausted {
            self.unlink(index);
            self.link_front(index, PoolList::Partial);
        }

        if !now_idle {
            return None;
        }

        self.unlink(index);
        let retired = self.arena[index as usize].take().map(|pool| RetiredPool {
            base: pool.base,
            os_bytes: pool.os_bytes,
        });
        self.vacant.push(index);
        self.stats.active_pools -= 1;
        retired
    }

    /// Every live pool with its handle, in arena order.
    pub(crate) fn pools(&self) -> impl Iterator<Item = (PoolHandle, &Pool)> + '_ {
        let table = self.id;
        self.arena.iter().enumerate().filter_map(move |(index, pool)| {
            #[allow(clippy::cast_possible_truncation)]
            let index = index as u32;
            pool.as_ref().map(|pool| (PoolHandle { table, index }, pool))
        })
    }

    /// Live pools on either list.
    pub(crate) fn pool_count(&self) -> usize {
        self.arena.iter().flatten().count()
    }

    pub(crate) fn usage(&self) -> TableUsage {
        let pools = self.pool_count();
        let allocated = pools * self.slab_bytes;
        let used = self.stats.active_requests * self.block_size;
        let tails = pools * (self.slab_bytes - self.allocated_bytes());
        // Average rounding loss per request, scaled to the live ones.
        let rounding = if self.stats.total_requests == 0 {
            0
        } else {
            (self.stats.total_waste as f64 / self.stats.total_requests as f64 * self.stats.active_requests as f64) as usize
        };
        TableUsage {
            allocated,
            used,
            slack: allocated.saturating_sub(used + tails),
            waste: rounding + tails,
        }
    }

    /// Remove every pool, returning their slabs. Used on allocator drop.
    pub(crate) fn drain(&mut self) -> Vec<RetiredPool> {
        self.partial = None;
        self.exhausted = None;
        self.vacant.clear();
        self.stats.active_pools = 0;
        self.arena
            .drain(..)
            .flatten()
            .map(|pool| RetiredPool {
                base: pool.base,
                os_bytes: pool.os_bytes,
            })
            .collect()
    }

    /// Walk both lists and report every structural violation.
    pub(crate) fn check(&self, out: &mut Vec<HeapViolation>) {
        let table = self.id;
        let mut listed = 0usize;
        let live = self.pool_count();

        for (list, mut cursor) in [(PoolList::Partial, self.partial), (PoolList::Exhausted, self.exhausted)] {
            let mut expected_prev = None;
            let mut steps = 0usize;
            while let Some(index) = cursor {
                steps += 1;
                if steps > live {
                    out.push(HeapViolation::BrokenLink { table, pool: index });
                    break;
                }
                let Some(Some(pool)) = self.arena.get(index as usize) else {
                    out.push(HeapViolation::BrokenLink { table, pool: index });
                    break;
                };
                listed += 1;
                if pool.prev != expected_prev {
                    out.push(HeapViolation::BrokenLink { table, pool: index });
                }
                if pool.list != list {
                    out.push(HeapViolation::WrongList { table, pool: index });
                }
                match list {
                    PoolList::Partial if pool.free.is_empty() => {
                        out.push(HeapViolation::PartialWithoutFree { table, pool: index });
                    }
                    PoolList::Exhausted if !pool.free.is_empty() => {
                        out.push(HeapViolation::ExhaustedWithFree { table, pool: index });
                    }
                    _ => {}
                }
                self.check_runs(index, pool, out);
                expected_prev = Some(index);
                cursor = pool.next;
            }
        }

        if listed != live {
            out.push(HeapViolation::Unlisted { table, pools: live, listed });
        }
    }

    fn check_runs(&self, index: u32, pool: &Pool, out: &mut Vec<HeapViolation>) {
        let table = self.id;
        let base = pool.base.as_ptr() as usize;
        let end = base + self.allocated_bytes();
        // Safety: runs only reads headers written by this pool's free list;
        // the limit stops a corrupted cycle.
        let runs = unsafe { pool.free.runs(pool.blocks as usize + 1) };
        let mut free = 0u64;
        for (run, count) in runs {
            let addr = run.as_ptr() as usize;
            if count == 0 {
                out.push(HeapViolation::EmptyRun { table, pool: index, run: addr });
            }
            let run_end = addr.saturating_add(count as usize * self.block_size);
            if addr < base || run_end > end || !(addr - base).is_multiple_of(self.block_size) {
                out.push(HeapViolation::RunOutOfBounds { table, pool: index, run: addr });
            }
            free += u64::from(count);
        }
        if u64::from(pool.taken) + free != u64::from(pool.blocks) || pool.taken == 0 {
            out.push(HeapViolation::Accounting {
                table,
                pool: index,
                taken: pool.taken,
                free,
                blocks: pool.blocks,
            });
        }
    }

    /// Overwrite the count of the first free run of the first partial pool.
    ///
    /// # Safety
    /// Test-only corruption hook; the table must have a partial pool.
    #[cfg(test)]
    pub(crate) unsafe fn corrupt_first_run(&mut self, count: u32) {
        if let Some(index) = self.partial {
            // Safety: upheld by caller.
            unsafe { self.pool_mut(index).free.corrupt_head_count(count) };
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    const BLOCK: usize = 64;
    const SLAB: usize = 4096;

    /// Heap-backed stand-in for an OS slab.
    struct Slab {
        ptr: NonNull<u8>,
        layout: std::alloc::Layout,
    }

    impl Slab {
        fn new() -> Self {
            let layout = std::alloc::Layout::from_size_align(SLAB, SLAB).unwrap();
            // Safety: Test code; non-zero layout.
            let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) }).unwrap();
            Self { ptr, layout }
        }
    }

    impl Drop for Slab {
        fn drop(&mut self) {
            // Safety: Test code.
            unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }

    fn table() -> PoolTable {
        PoolTable::new(5, TableLayout { block_size: BLOCK, slab_bytes: SLAB })
    }

    fn violations(t: &PoolTable) -> Vec<HeapViolation> {
        let mut out = Vec::new();
        t.check(&mut out);
        out
    }

    #[test]
    fn test_pool_alloc_all_blocks_then_exhausted() {
        let slab = Slab::new();
        let mut t = table();
        // Safety: Test code.
        let handle = unsafe { t.insert_pool(slab.ptr, SLAB) };
        assert_eq!(handle, PoolHandle { table: 5, index: 0 });

        let mut seen = std::collections::HashSet::new();
        for _ in 0..t.blocks_per_pool() {
            // Empty pools are only observable transiently; check after the first alloc.
            let p = t.alloc_block(BLOCK).unwrap();
            assert!(seen.insert(p.as_ptr() as usize));
            assert!(violations(&t).is_empty(), "{:?}", violations(&t));
        }
        assert!(!t.has_partial());
        assert!(t.alloc_block(BLOCK).is_none());
        assert_eq!(t.pool(handle).unwrap().blocks_taken(), t.blocks_per_pool());
    }

    #[test]
    fn test_free_moves_exhausted_back_to_partial() {
        let slab = Slab::new();
        let mut t = table();
        // Safety: Test code.
        unsafe { t.insert_pool(slab.ptr, SLAB) };
        let blocks: Vec<_> = (0..t.blocks_per_pool()).map(|_| t.alloc_block(BLOCK).unwrap()).collect();
        assert!(!t.has_partial());

        // Safety: Test code; block is live.
        assert_eq!(unsafe { t.free_block(0, blocks[3]) }, None);
        assert!(t.has_partial());
        assert!(violations(&t).is_empty());
        assert_eq!(t.alloc_block(BLOCK), Some(blocks[3]));
    }

    #[test]
    fn test_last_free_retires_pool() {
        let slab = Slab::new();
        let mut t = table();
        // Safety: Test code.
        unsafe { t.insert_pool(slab.ptr, SLAB) };
        let a = t.alloc_block(10).unwrap();
        let b = t.alloc_block(BLOCK).unwrap();
        // Safety: Test code.
        unsafe {
            assert_eq!(t.free_block(0, a), None);
            assert_eq!(
                t.free_block(0, b),
                Some(RetiredPool { base: slab.ptr, os_bytes: SLAB })
            );
        }
        assert_eq!(t.pool_count(), 0);
        assert!(!t.has_partial());
        assert_eq!(t.stats().active_pools, 0);
        assert_eq!(t.stats().max_active_pools, 1);
        assert_eq!(t.stats().total_requests, 2);
        assert_eq!(t.stats().min_request, 10);
        assert_eq!(t.stats().total_waste, (BLOCK - 10) as u64);
        // Arena slot is recycled.
        assert_eq!(t.next_handle(), PoolHandle { table: 5, index: 0 });
    }

    #[test]
    fn test_usage_splits_slack_and_waste() {
        let slab = Slab::new();
        // 85 blocks of 48 bytes leave a 16-byte tail.
        let mut t = PoolTable::new(7, TableLayout { block_size: 48, slab_bytes: SLAB });
        assert_eq!(t.usage(), TableUsage::default());
        assert_eq!(t.usage().efficiency(), 100.0);

        // Safety: Test code.
        unsafe { t.insert_pool(slab.ptr, SLAB) };
        let a = t.alloc_block(40).unwrap();
        let _b = t.alloc_block(48).unwrap();
        assert_eq!(
            t.usage(),
            TableUsage { allocated: SLAB, used: 96, slack: SLAB - 96 - 16, waste: 8 + 16 }
        );

        // Safety: Test code; a is live.
        assert_eq!(unsafe { t.free_block(0, a) }, None);
        let usage = t.usage();
        assert_eq!(usage.used, 48);
        assert_eq!(usage.waste, 4 + 16);
        assert_eq!(usage.slack, SLAB - 48 - 16);
        assert!((usage.efficiency() - (SLAB - 20) as f64 * 100.0 / SLAB as f64).abs() < 1e-9);
    }

    #[test]
    fn test_lists_link_multiple_pools() {
        let slabs = [Slab::new(), Slab::new(), Slab::new()];
        let mut t = table();
        let mut firsts = Vec::new();
        for slab in &slabs {
            // Safety: Test code.
            let h = unsafe { t.insert_pool(slab.ptr, SLAB) };
            // New pools go to the head of the partial list.
            let p = t.alloc_block(BLOCK).unwrap();
            firsts.push((h, p));
        }
        assert_eq!(t.pool_count(), 3);
        assert!(violations(&t).is_empty());

        // Retire the middle pool and keep the lists intact.
        let (h, p) = firsts[1];
        // Safety: Test code.
        assert!(unsafe { t.free_block(h.index, p) }.is_some());
        assert_eq!(t.pool_count(), 2);
        assert!(violations(&t).is_empty(), "{:?}", violations(&t));
    }

    #[test]
    fn test_check_detects_zero_count_run() {
        let slab = Slab::new();
        let mut t = table();
        // Safety: Test code.
        unsafe { t.insert_pool(slab.ptr, SLAB) };
        let _live = t.alloc_block(BLOCK).unwrap();
        // Safety: Test code; the table has a partial pool.
        unsafe { t.corrupt_first_run(0) };
        let found = violations(&t);
        assert!(found.iter().any(|v| matches!(v, HeapViolation::EmptyRun { .. })), "{found:?}");
        assert!(found.iter().any(|v| matches!(v, HeapViolation::Accounting { .. })), "{found:?}");
        assert!(found[0].to_string().contains("table 5"));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Double free")]
    fn test_double_free_panics_in_debug() {
        let slab = Slab::new();
        let mut t = table();
        // Safety: Test code.
        unsafe { t.insert_pool(slab.ptr, SLAB) };
        let a = t.alloc_block(BLOCK).unwrap();
        let _keep = t.alloc_block(BLOCK).unwrap();
        // Safety: Test code; the second free is the bug under test.
        unsafe {
            t.free_block(0, a);
            t.free_block(0, a);
        }
    }

    #[test]
    fn test_drain_returns_every_slab() {
        let slabs = [Slab::new(), Slab::new()];
        let mut t = table();
        for slab in &slabs {
            // Safety: Test code.
            unsafe { t.insert_pool(slab.ptr, SLAB) };
            t.alloc_block(BLOCK).unwrap();
        }
        let drained = t.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(t.pool_count(), 0);
        assert!(violations(&t).is_empty());
    }
}
