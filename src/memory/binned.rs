use super::deferred::PendingFrees;
use super::indirect::{IndirectTable, Owner, PoolHandle};
use super::malloc::Malloc;
use super::os_cache::{Admission, CachePolicy, CachedBlock, FreeBlockCache};
use super::pool::{HeapViolation, PoolTable, TableUsage};
use super::size_class::{self, BINNED_SIZE_LIMIT, DEFAULT_ALIGNMENT, PAGE_SIZE_LIMIT};
use super::stats::{self, AllocatorCounters, AllocatorStats};
use super::vm::{PlatformVmOps, VmError, VmOps};
use crate::sync::{Mutex, MutexGuard, lock};
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

pub(crate) const DEFAULT_POOL_SIZE: usize = 64 * 1024;

pub(crate) const DEFAULT_ADDRESS_LIMIT: usize = 1 << 40;

/// How a [`BinnedAllocator`] serializes concurrent callers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LockingStrategy {
    /// One allocator-wide mutex held across every public operation.
    CoarseGrained,
    /// A mutex per pool table plus one for the lookup table and the cache.
    /// Lock order is always table, then shared state.
    #[default]
    FineGrained,
    /// Coarse locking, but `release` only pushes onto a lock-free queue that
    /// the next locked operation drains.
    DeferredFree,
}

/// Configuration for `BinnedAllocator`. All fields have sensible defaults.
/// Set at init time via `BinnedAllocator::with_config()`.
#[derive(Clone, Debug)]
pub struct BinnedAllocatorConfig {
    /// Page size every OS allocation is aligned to. Power of two no larger
    /// than 64 KiB and no smaller than the OS page. Default: 0 (OS page size).
    pub page_size: usize,

    /// Expected span of the address space. Only sizes the lookup table.
    /// Default: `1 << 40`.
    pub address_limit: usize,

    /// Slab size of the small-block tables. A multiple of `page_size`, at
    /// least 32 KiB. Default: 64 KiB.
    pub pool_size: usize,

    /// Entry limit of the free-block cache. 0 disables caching. Default: 32.
    pub cache_max_entries: usize,

    /// Byte budget of the free-block cache. Default: 4 MiB.
    pub cache_max_bytes: usize,

    /// Largest block the cache keeps. Default: 0 (= `pool_size`).
    pub cache_max_block_size: usize,

    /// A cached block of `b` bytes serves a request of `s` bytes when
    /// `b * denominator <= s * numerator`. Default: 4 / 3.
    pub cache_reuse_numerator: usize,
    pub cache_reuse_denominator: usize,

    pub locking: LockingStrategy,
}

impl Default for BinnedAllocatorConfig {
    fn default() -> Self {
        Self {
            page_size: 0, // 0 = OS page size
            address_limit: DEFAULT_ADDRESS_LIMIT,
            pool_size: DEFAULT_POOL_SIZE,
            cache_max_entries: 32,
            cache_max_bytes: 4 * 1024 * 1024,
            cache_max_block_size: 0, // 0 = pool_size
            cache_reuse_numerator: 4,
            cache_reuse_denominator: 3,
            locking: LockingStrategy::FineGrained,
        }
    }
}

impl BinnedAllocatorConfig {
    /// Fill in the auto-detected fields and reject inconsistent settings.
    fn resolve(&mut self, os_page: usize) -> Result<(), VmError> {
        if self.page_size == 0 {
            self.page_size = os_page;
        }
        if self.cache_max_block_size == 0 {
            self.cache_max_block_size = self.pool_size;
        }
        let page = self.page_size;
        let invalid = |msg: String| Err(VmError::InitializationFailed(msg));

        if !page.is_power_of_two() || page > PAGE_SIZE_LIMIT {
            return invalid(format!(
                "Invalid page_size {page}: must be a power of two no larger than {PAGE_SIZE_LIMIT}"
            ));
        }
        if page < os_page {
            return invalid(format!(
                "Invalid page_size {page}: smaller than the OS page size ({os_page})"
            ));
        }
        if !self.address_limit.is_power_of_two() || self.address_limit <= page {
            return invalid(format!(
                "Invalid address_limit {:#x}: must be a power of two above page_size ({page})",
                self.address_limit
            ));
        }
        if self.pool_size < BINNED_SIZE_LIMIT || !self.pool_size.is_multiple_of(page) {
            return invalid(format!(
                "Invalid pool_size {}: must be a multiple of page_size ({page}) and at least {BINNED_SIZE_LIMIT}",
                self.pool_size
            ));
        }
        if self.cache_reuse_denominator == 0 || self.cache_reuse_numerator < self.cache_reuse_denominator {
            return invalid(format!(
                "Invalid cache reuse window {}/{}: must be at least 1",
                self.cache_reuse_numerator, self.cache_reuse_denominator
            ));
        }
        Ok(())
    }

    fn cache_policy(&self) -> CachePolicy {
        CachePolicy {
            max_entries: self.cache_max_entries,
            max_bytes: self.cache_max_bytes,
            max_block_size: self.cache_max_block_size,
            reuse_num: self.cache_reuse_numerator,
            reuse_den: self.cache_reuse_denominator,
        }
    }
}

/// State behind the AccessGuard: every pointer lookup and every cached OS
/// block.
struct Shared {
    indirect: IndirectTable,
    cache: FreeBlockCache,
}

/// Binned allocator over an OS page provider.
///
/// Requests below 32 KiB are served from per-size-class pools of 64 KiB
/// slabs. Larger requests map pages directly. Freed slabs and large blocks go
/// through a small cache before being unmapped. Any pointer resolves to its
/// owner through a page-indexed lookup table, so `release` needs no size.
///
/// The allocator keeps its own bookkeeping in `std` collections and must not
/// be installed as the global allocator.
pub struct BinnedAllocator<V: VmOps = PlatformVmOps> {
    config: BinnedAllocatorConfig,
    page_size: usize,
    page_pools: bool,
    block_sizes: Box<[usize]>,
    tables: Box<[Mutex<PoolTable>]>,
    shared: Mutex<Shared>,
    /// Allocator-wide lock of the coarse and deferred strategies.
    global: Mutex<()>,
    pending: PendingFrees,
    counters: AllocatorCounters,
    _vm: PhantomData<fn() -> V>,
}

impl BinnedAllocator<PlatformVmOps> {
    /// Create a new `BinnedAllocator` with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `VmError` if the OS page size is not supported.
    pub fn new() -> Result<Self, VmError> {
        Self::with_config(BinnedAllocatorConfig::default())
    }
}

impl<V: VmOps> BinnedAllocator<V> {
    /// Create a new `BinnedAllocator` with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns `VmError::InitializationFailed` if the configuration is
    /// invalid (e.g., pool size not page-aligned).
    pub fn with_config(mut config: BinnedAllocatorConfig) -> Result<Self, VmError> {
        config.resolve(V::page_size())?;
        let page_size = config.page_size;

        let layouts = size_class::table_layouts(page_size, config.pool_size);
        let block_sizes = layouts.iter().map(|l| l.block_size).collect();
        let tables = layouts
            .iter()
            .enumerate()
            .map(|(id, &layout)| Mutex::new(PoolTable::new(u16::try_from(id).unwrap_or(u16::MAX), layout)))
            .collect();

        let shared = Shared {
            indirect: IndirectTable::new(page_size, config.address_limit),
            cache: FreeBlockCache::new(config.cache_policy()),
        };

        log::debug!(
            "[binned] allocator ready: page {page_size}, pool {}, {} tables, {:?} locking",
            config.pool_size,
            layouts.len(),
            config.locking
        );

        Ok(Self {
            page_pools: page_size == PAGE_SIZE_LIMIT,
            page_size,
            block_sizes,
            tables,
            shared: Mutex::new(shared),
            global: Mutex::new(()),
            pending: PendingFrees::new(),
            counters: AllocatorCounters::new(),
            config,
            _vm: PhantomData,
        })
    }

    pub fn config(&self) -> &BinnedAllocatorConfig {
        &self.config
    }

    /// Page size OS allocations are aligned to.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Outer lock for the coarse strategies; `None` when fine-grained.
    fn outer(&self) -> Option<MutexGuard<'_, ()>> {
        match self.config.locking {
            LockingStrategy::FineGrained => None,
            LockingStrategy::CoarseGrained | LockingStrategy::DeferredFree => Some(lock!(self.global)),
        }
    }

    /// Drain deferred frees. Caller holds the outer lock.
    fn drain_pending(&self) {
        if self.config.locking != LockingStrategy::DeferredFree || self.pending.is_empty() {
            return;
        }
        let freed = self.pending.drain(|ptr| {
            // Safety: only live allocations are queued by `release`.
            unsafe { self.free_internal(ptr) }
        });
        log::trace!("[binned] drained {freed} deferred frees");
    }

    /// Allocate `size` bytes aligned to `align` (0 = 16).
    ///
    /// Out of memory is fatal: it is logged and routed to
    /// [`std::alloc::handle_alloc_error`]. See [`try_allocate`](Self::try_allocate)
    /// for the fallible form.
    pub fn allocate(&self, size: usize, align: usize) -> NonNull<u8> {
        let _outer = self.outer();
        self.drain_pending();
        self.alloc_or_abort(size, align)
    }

    /// Allocate `size` bytes aligned to `align` (0 = 16).
    ///
    /// # Errors
    ///
    /// Returns `VmError::OutOfMemory` if the OS refuses the memory even after
    /// the free-block cache has been released.
    pub fn try_allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, VmError> {
        let _outer = self.outer();
        self.drain_pending();
        self.alloc_internal(size, align)
    }

    fn alloc_internal(&self, size: usize, align: usize) -> Result<NonNull<u8>, VmError> {
        let align = if align == 0 { DEFAULT_ALIGNMENT } else { align };
        debug_assert!(align.is_power_of_two(), "alignment {align} is not a power of two");
        debug_assert!(
            align <= self.page_size,
            "alignment {align} exceeds the page size ({})",
            self.page_size
        );
        let oom = || VmError::OutOfMemory { size, align };

        let (normalized, align) = size_class::normalize(size, align).ok_or_else(oom)?;
        let ptr = match size_class::select_table(normalized, align, self.page_pools) {
            Some(table) => self.alloc_pooled(table, normalized),
            None => self.alloc_os(normalized),
        };
        ptr.ok_or_else(oom)
    }

    fn alloc_pooled(&self, table_idx: usize, request: usize) -> Option<NonNull<u8>> {
        let mut table = lock!(self.tables[table_idx]);
        if !table.has_partial() {
            self.create_pool(&mut table)?;
        }
        let block = table.alloc_block(request)?;
        self.counters.used_bytes.add(table.block_size());
        self.counters.current_allocs.add(1);
        self.counters.total_allocs.add(1);
        Some(block)
    }

    /// Map a slab and adopt it as a fresh partial pool. Caller holds the
    /// table lock.
    fn create_pool(&self, table: &mut PoolTable) -> Option<()> {
        let block = self.reserve(table.slab_bytes())?;
        let handle = table.next_handle();
        lock!(self.shared)
            .indirect
            .register_pool(block.ptr.as_ptr().addr(), block.bytes, handle);

        // Safety: the block is a fresh page-aligned mapping of `block.bytes`
        // bytes that nothing else references.
        let inserted = unsafe { table.insert_pool(block.ptr, block.bytes) };
        debug_assert_eq!(inserted, handle);

        self.counters.os_bytes.add(block.bytes);
        self.counters.waste_bytes.add(block.bytes - table.allocated_bytes());
        stats::TOTAL_OS_BYTES.add(block.bytes);
        log::debug!(
            "[binned] new pool {}:{} for {}-byte blocks at {:p} ({} bytes, {} blocks)",
            handle.table,
            handle.index,
            table.block_size(),
            block.ptr,
            block.bytes,
            table.blocks_per_pool()
        );
        Some(())
    }

    /// Map `size` bytes, already normalized, straight from the cache or OS.
    fn alloc_os(&self, size: usize) -> Option<NonNull<u8>> {
        let bytes = size.checked_next_multiple_of(self.page_size)?;
        let block = self.reserve(bytes)?;
        lock!(self.shared)
            .indirect
            .register_os(block.ptr.as_ptr().expose_provenance(), size, block.bytes);

        self.counters.os_bytes.add(block.bytes);
        self.counters.waste_bytes.add(block.bytes - size);
        self.counters.used_bytes.add(size);
        self.counters.current_allocs.add(1);
        self.counters.total_allocs.add(1);
        stats::TOTAL_OS_BYTES.add(block.bytes);
        Some(block.ptr)
    }

    /// Get `bytes` of page-aligned memory, from the cache when a block fits.
    ///
    /// The returned block may be larger than asked for; its real size must be
    /// recorded. On OS failure with a non-empty cache the whole cache is
    /// released and the call retried once. Never holds the AccessGuard
    /// across an OS call.
    fn reserve(&self, bytes: usize) -> Option<CachedBlock> {
        let cached = lock!(self.shared).cache.take(bytes);
        if let Some(block) = cached {
            self.counters.cache_hits.add(1);
            log::trace!(
                "[binned] cache hit: {} bytes at {:p} for a {bytes}-byte request",
                block.bytes,
                block.ptr
            );
            return Some(block);
        }

        match self.map(bytes) {
            Ok(ptr) => Some(CachedBlock { ptr, bytes }),
            Err(err) => {
                let flushed = lock!(self.shared).cache.drain();
                if flushed.is_empty() {
                    return None;
                }
                log::warn!(
                    "[binned] OS refused {bytes} bytes ({err}); releasing {} cached blocks and retrying",
                    flushed.len()
                );
                self.counters.cache_flushes.add(1);
                flushed.into_iter().for_each(|block| self.unmap(block));
                self.map(bytes).ok().map(|ptr| CachedBlock { ptr, bytes })
            }
        }
    }

    fn map(&self, bytes: usize) -> Result<NonNull<u8>, VmError> {
        self.counters.os_reserve_calls.add(1);
        // Safety: bytes is a non-zero multiple of the page size and the page
        // size was validated against the provider's limits.
        unsafe { V::reserve_and_commit(bytes, self.page_size) }
    }

    fn unmap(&self, block: CachedBlock) {
        self.counters.os_release_calls.add(1);
        // Safety: the block came from `map` with this size and is no longer
        // referenced by a pool, the lookup table or the cache.
        if let Err(err) = unsafe { V::release(block.ptr, block.bytes) } {
            log::error!("[binned] failed to release {} bytes at {:p}: {err}", block.bytes, block.ptr);
        }
    }

    /// Release whatever the cache turned away or evicted.
    fn settle(&self, admission: Admission) {
        match admission {
            Admission::Cached { evicted: None } => {}
            Admission::Cached { evicted: Some(block) } | Admission::Rejected(block) => self.unmap(block),
        }
    }

    /// Free `ptr` in every strategy. Caller holds the outer lock if any.
    ///
    /// # Safety
    /// `ptr` must be a live allocation of this allocator.
    unsafe fn free_internal(&self, ptr: NonNull<u8>) {
        let owner = lock!(self.shared).indirect.resolve(ptr.as_ptr().addr());
        match owner {
            Some(Owner::Pool { handle, .. }) => {
                // Safety: upheld by caller.
                unsafe { self.free_pooled(handle, ptr) };
            }
            Some(Owner::Os { base, requested, os_bytes }) => {
                debug_assert_eq!(base, ptr.as_ptr().addr(), "interior pointer {ptr:p} released");
                self.counters.os_bytes.sub(os_bytes);
                self.counters.waste_bytes.sub(os_bytes - requested);
                self.counters.used_bytes.sub(requested);
                self.counters.current_allocs.sub(1);
                stats::TOTAL_OS_BYTES.sub(os_bytes);

                let admission = {
                    let mut shared = lock!(self.shared);
                    shared.indirect.vacate(base, self.page_size);
                    shared.cache.insert(CachedBlock { ptr, bytes: os_bytes })
                };
                self.settle(admission);
            }
            None => debug_assert!(false, "[binned] release of unknown pointer {ptr:p}"),
        }
    }

    /// # Safety
    /// `ptr` must be a live block of pool `handle`.
    unsafe fn free_pooled(&self, handle: PoolHandle, ptr: NonNull<u8>) {
        let mut table = lock!(self.tables[handle.table as usize]);
        // Safety: upheld by caller.
        let retired = unsafe { table.free_block(handle.index, ptr) };
        self.counters.used_bytes.sub(table.block_size());
        self.counters.current_allocs.sub(1);

        let Some(pool) = retired else { return };
        let slack = pool.os_bytes - table.allocated_bytes();
        // Lock order: table, then shared.
        let admission = {
            let mut shared = lock!(self.shared);
            shared.indirect.vacate(pool.base.as_ptr().addr(), pool.os_bytes);
            shared.cache.insert(CachedBlock {
                ptr: pool.base,
                bytes: pool.os_bytes,
            })
        };
        log::debug!(
            "[binned] pool {}:{} for {}-byte blocks emptied, slab {:p} ({} bytes) {}",
            handle.table,
            handle.index,
            table.block_size(),
            pool.base,
            pool.os_bytes,
            if matches!(admission, Admission::Rejected(_)) { "unmapped" } else { "cached" }
        );
        drop(table);

        self.counters.os_bytes.sub(pool.os_bytes);
        self.counters.waste_bytes.sub(slack);
        stats::TOTAL_OS_BYTES.sub(pool.os_bytes);
        self.settle(admission);
    }

    /// Release `ptr`. With [`LockingStrategy::DeferredFree`] the block is only
    /// queued; the next locked operation frees it.
    ///
    /// # Safety
    /// `ptr` must be a live allocation of this allocator, not used afterwards.
    pub unsafe fn release(&self, ptr: NonNull<u8>) {
        match self.config.locking {
            // Safety: upheld by caller; every block is at least 16 bytes and
            // 16-aligned.
            LockingStrategy::DeferredFree => unsafe { self.pending.push(ptr) },
            LockingStrategy::CoarseGrained => {
                let _outer = lock!(self.global);
                // Safety: upheld by caller.
                unsafe { self.free_internal(ptr) }
            }
            // Safety: upheld by caller.
            LockingStrategy::FineGrained => unsafe { self.free_internal(ptr) },
        }
    }

    /// Resize `ptr` to `new_size` bytes aligned to `align` (0 = 16).
    ///
    /// Stays in place when a pooled size keeps its size class, or when a
    /// large block still covers `new_size` and at least two thirds of it
    /// would be used. Otherwise moves, copying the smaller of the old usable
    /// size and `new_size`. `None` allocates; `new_size == 0` frees and
    /// returns `None`.
    ///
    /// # Safety
    /// `ptr` must be a live allocation of this allocator. After a move the
    /// old pointer is dangling.
    pub unsafe fn reallocate(&self, ptr: Option<NonNull<u8>>, new_size: usize, align: usize) -> Option<NonNull<u8>> {
        let _outer = self.outer();
        self.drain_pending();

        let Some(ptr) = ptr else {
            return Some(self.alloc_or_abort(new_size, align));
        };
        if new_size == 0 {
            // Safety: upheld by caller.
            unsafe { self.free_internal(ptr) };
            return None;
        }
        let align = if align == 0 { DEFAULT_ALIGNMENT } else { align };
        let normalized = size_class::normalize(new_size, align);

        let owner = lock!(self.shared).indirect.resolve(ptr.as_ptr().addr());
        let old_usable = match owner {
            Some(Owner::Pool { handle, .. }) => {
                let target =
                    normalized.and_then(|(size, align)| size_class::select_table(size, align, self.page_pools));
                if target == Some(handle.table as usize) {
                    return Some(ptr);
                }
                self.block_sizes[handle.table as usize]
            }
            Some(Owner::Os { base, requested, os_bytes }) => {
                if let Some((size, align)) = normalized {
                    let fits = size <= os_bytes && size.saturating_mul(3) >= os_bytes.saturating_mul(2);
                    if fits && base.is_multiple_of(align) {
                        lock!(self.shared).indirect.update_os(base, size);
                        self.counters.used_bytes.sub(requested);
                        self.counters.waste_bytes.sub(os_bytes - requested);
                        self.counters.used_bytes.add(size);
                        self.counters.waste_bytes.add(os_bytes - size);
                        return Some(ptr);
                    }
                }
                requested
            }
            None => {
                debug_assert!(false, "[binned] reallocate of unknown pointer {ptr:p}");
                return None;
            }
        };

        let moved = self.alloc_or_abort(new_size, align);
        // Safety: both ranges are live, distinct allocations of at least the
        // copied length.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), old_usable.min(new_size));
            self.free_internal(ptr);
        }
        Some(moved)
    }

    /// `alloc_internal` with the fatal OOM path. Caller holds the outer lock.
    fn alloc_or_abort(&self, size: usize, align: usize) -> NonNull<u8> {
        match self.alloc_internal(size, align) {
            Ok(ptr) => ptr,
            Err(err) => {
                log::error!("[binned] {err}");
                let layout = std::alloc::Layout::from_size_align(size, align.max(DEFAULT_ALIGNMENT))
                    .unwrap_or(std::alloc::Layout::new::<u8>());
                std::alloc::handle_alloc_error(layout)
            }
        }
    }

    /// Usable size of `ptr`: the block size for pooled pointers, the request
    /// rounded up to its alignment for large ones, `None` if the pointer is
    /// unknown.
    ///
    /// # Safety
    /// `ptr` must not be released concurrently.
    pub unsafe fn get_allocation_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        let _outer = self.outer();
        match lock!(self.shared).indirect.resolve(ptr.as_ptr().addr())? {
            Owner::Pool { handle, .. } => Some(self.block_sizes[handle.table as usize]),
            Owner::Os { requested, .. } => Some(requested),
        }
    }

    /// Drain deferred frees, then unmap every cached block.
    pub fn trim(&self) {
        let _outer = self.outer();
        self.drain_pending();
        let drained = {
            let mut shared = lock!(self.shared);
            if shared.cache.is_empty() {
                return;
            }
            shared.cache.drain()
        };
        log::debug!("[binned] trim released {} cached blocks", drained.len());
        drained.into_iter().for_each(|block| self.unmap(block));
    }

    /// Free everything queued by [`release`](Self::release) under
    /// [`LockingStrategy::DeferredFree`]. A no-op for the other strategies.
    pub fn flush_pending_frees(&self) {
        let _outer = self.outer();
        self.drain_pending();
    }

    pub fn stats(&self) -> AllocatorStats {
        let (blocks, bytes) = {
            let shared = lock!(self.shared);
            (shared.cache.len(), shared.cache.cached_bytes())
        };
        self.counters.snapshot(blocks, bytes)
    }

    /// Every invariant violation in the pool tables and their lookup entries.
    pub(crate) fn check_heap(&self) -> Vec<HeapViolation> {
        let mut violations = Vec::new();
        for table in &self.tables {
            let table = lock!(table);
            table.check(&mut violations);

            let shared = lock!(self.shared);
            for (handle, pool) in table.pools() {
                let base = pool.base().as_ptr().addr();
                let expected = Some(Owner::Pool { handle, base });
                let last_page = base + pool.os_bytes() - 1;
                if shared.indirect.resolve(base) != expected || shared.indirect.resolve(last_page) != expected {
                    violations.push(HeapViolation::Unregistered {
                        table: handle.table,
                        pool: handle.index,
                    });
                }
            }
        }
        violations
    }

    /// Walk every pool and check the free lists, list links and accounting.
    /// Each violation is logged; debug builds also assert.
    pub fn validate_heap(&self) -> bool {
        let _outer = self.outer();
        self.validate_locked()
    }

    /// Caller holds the outer lock.
    fn validate_locked(&self) -> bool {
        let violations = self.check_heap();
        for violation in &violations {
            log::error!("[binned] heap corruption: {violation}");
        }
        debug_assert!(violations.is_empty(), "heap validation failed: {violations:?}");
        violations.is_empty()
    }

    /// Validate the heap, then write a usage report: global totals, one row
    /// per size class in use with its slack and waste, pool totals and the
    /// live large allocations. Sizes in the table are in KiB.
    ///
    /// # Errors
    ///
    /// Propagates errors from `sink`.
    pub fn dump_allocations<W: fmt::Write + ?Sized>(&self, sink: &mut W) -> fmt::Result {
        let _outer = self.outer();
        self.validate_locked();
        let s = self.stats();
        let mib = |bytes: usize| bytes as f64 / (1024.0 * 1024.0);

        writeln!(sink, "Binned allocator stats")?;
        writeln!(sink, "Current OS memory:   {:9.2} MiB (peak {:.2} MiB)", mib(s.os_current), mib(s.os_peak))?;
        writeln!(sink, "Current waste:       {:9.2} MiB (peak {:.2} MiB)", mib(s.waste_current), mib(s.waste_peak))?;
        writeln!(sink, "Current used:        {:9.2} MiB (peak {:.2} MiB)", mib(s.used_current), mib(s.used_peak))?;
        writeln!(sink, "Current allocations: {:9} ({} total)", s.current_allocs, s.total_allocs)?;
        writeln!(sink, "Cached OS blocks:    {:9} ({:.2} MiB)", s.cached_blocks, mib(s.cached_bytes))?;
        writeln!(sink)?;
        writeln!(
            sink,
            "Block Size Num Pools Max Pools Cur Allocs Total Allocs Min Req Max Req Mem Used Mem Slack Mem Waste Efficiency"
        )?;
        writeln!(
            sink,
            "---------- --------- --------- ---------- ------------ ------- ------- -------- --------- --------- ----------"
        )?;

        let mut totals = TableUsage::default();
        let (mut active, mut requests, mut pools) = (0usize, 0u64, 0usize);
        for table in &self.tables {
            let (block_size, st, usage) = {
                let table = lock!(table);
                (table.block_size(), table.stats(), table.usage())
            };
            if st.total_requests == 0 {
                continue;
            }
            writeln!(
                sink,
                "{:>10} {:>9} {:>9} {:>10} {:>12} {:>7} {:>7} {:>7}K {:>8}K {:>8}K {:>9.2}%",
                block_size,
                st.active_pools,
                st.max_active_pools,
                st.active_requests,
                st.total_requests,
                st.min_request,
                st.max_request,
                usage.used / 1024,
                usage.slack / 1024,
                usage.waste / 1024,
                usage.efficiency()
            )?;
            totals.allocated += usage.allocated;
            totals.used += usage.used;
            totals.slack += usage.slack;
            totals.waste += usage.waste;
            active += st.active_requests;
            requests += st.total_requests;
            pools += st.active_pools;
        }

        writeln!(sink)?;
        writeln!(
            sink,
            "{}K allocated in pools (with {}K slack and {}K waste). Efficiency {:.2}%",
            totals.allocated / 1024,
            totals.slack / 1024,
            totals.waste / 1024,
            totals.efficiency()
        )?;
        writeln!(sink, "Allocations {active} current / {requests} total (in {pools} pools)")?;

        let (count, requested, mapped, slot_pages) = {
            let shared = lock!(self.shared);
            let (count, requested, mapped) = shared
                .indirect
                .os_allocations()
                .fold((0usize, 0usize, 0usize), |(n, r, m), (_, req, os)| (n + 1, r + req, m + os));
            (count, requested, mapped, shared.indirect.slot_pages())
        };
        writeln!(sink)?;
        writeln!(
            sink,
            "Large allocations:   {count:9} ({:.2} MiB requested, {:.2} MiB mapped)",
            mib(requested),
            mib(mapped)
        )?;
        writeln!(sink, "Lookup slot pages:   {slot_pages:9}")
    }
}

impl<V: VmOps> Drop for BinnedAllocator<V> {
    fn drop(&mut self) {
        self.drain_pending();
        let live = self.counters.current_allocs.get();
        if live > 0 {
            log::debug!("[binned] dropping allocator with {live} live allocations");
        }

        for table in &self.tables {
            let slabs = lock!(table).drain();
            for pool in slabs {
                self.unmap(CachedBlock {
                    ptr: pool.base,
                    bytes: pool.os_bytes,
                });
            }
        }

        let (large, cached) = {
            let mut shared = lock!(self.shared);
            let large: Vec<_> = shared.indirect.os_allocations().collect();
            for &(base, _, _) in &large {
                shared.indirect.vacate(base, self.page_size);
            }
            (large, shared.cache.drain())
        };
        for (base, _, bytes) in large {
            if let Some(ptr) = NonNull::new(std::ptr::with_exposed_provenance_mut::<u8>(base)) {
                self.unmap(CachedBlock { ptr, bytes });
            }
        }
        cached.into_iter().for_each(|block| self.unmap(block));

        stats::TOTAL_OS_BYTES.sub(self.counters.os_bytes.get());
    }
}

impl<V: VmOps> Malloc for BinnedAllocator<V> {
    fn malloc(&self, size: usize, align: usize) -> NonNull<u8> {
        self.allocate(size, align)
    }

    unsafe fn realloc(&self, ptr: Option<NonNull<u8>>, new_size: usize, align: usize) -> Option<NonNull<u8>> {
        // Safety: upheld by caller.
        unsafe { self.reallocate(ptr, new_size, align) }
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        // Safety: upheld by caller.
        unsafe { self.release(ptr) }
    }

    unsafe fn get_allocation_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        // Safety: upheld by caller.
        unsafe { BinnedAllocator::get_allocation_size(self, ptr) }
    }

    fn validate_heap(&self) -> bool {
        BinnedAllocator::validate_heap(self)
    }

    fn dump_allocations(&self, sink: &mut dyn fmt::Write) -> fmt::Result {
        BinnedAllocator::dump_allocations(self, sink)
    }

    fn trim(&self) {
        BinnedAllocator::trim(self);
    }
}
