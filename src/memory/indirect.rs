//! Pointer-to-owner lookup.
//!
//! Every OS page the allocator hands out has one [`Slot`]. Slots are grouped
//! into slot pages keyed by `addr >> (page_shift + slot_shift)`. A slot page
//! is created the first time any page in its range is registered and is never
//! removed; only the slots inside it are reset to [`Slot::Vacant`].

use ahash::AHashMap;

/// Upper bound on the slot-page map pre-sizing derived from `address_limit`.
const MAX_PRESIZED_PAGES: usize = 1024;

/// Stable identity of a pool: its table and its index in that table's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct PoolHandle {
    pub table: u16,
    pub index: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum Slot {
    #[default]
    Vacant,
    /// First page of a pooled slab.
    Pool(PoolHandle),
    /// Page `n` of a slab: the owning entry is `n` pages back.
    Trailing(u32),
    /// Base page of a direct OS allocation.
    Os { requested: usize, os_bytes: usize },
}

/// What a live pointer resolves to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Owner {
    Pool { handle: PoolHandle, base: usize },
    Os { base: usize, requested: usize, os_bytes: usize },
}

pub(crate) struct IndirectTable {
    page_shift: u32,
    slot_shift: u32,
    pages: AHashMap<usize, Box<[Slot]>>,
}

impl IndirectTable {
    /// `page_size` must be a power of two. `address_limit` only sizes the
    /// initial map; addresses beyond it still resolve.
    pub(crate) fn new(page_size: usize, address_limit: usize) -> Self {
        debug_assert!(page_size.is_power_of_two());
        let page_shift = page_size.trailing_zeros();
        let slots = (page_size / std::mem::size_of::<Slot>()).max(1);
        let slot_shift = slots.ilog2();
        let expected = address_limit
            .checked_shr(page_shift + slot_shift)
            .unwrap_or(0)
            .clamp(1, MAX_PRESIZED_PAGES);
        Self {
            page_shift,
            slot_shift,
            pages: AHashMap::with_capacity(expected),
        }
    }

    #[inline]
    fn page_size(&self) -> usize {
        1 << self.page_shift
    }

    #[inline]
    fn locate(&self, addr: usize) -> (usize, usize) {
        let page_no = addr >> self.page_shift;
        let key = page_no >> self.slot_shift;
        let index = page_no & ((1 << self.slot_shift) - 1);
        (key, index)
    }

    #[inline]
    fn get(&self, addr: usize) -> Slot {
        let (key, index) = self.locate(addr);
        self.pages.get(&key).map_or(Slot::Vacant, |page| page[index])
    }

    fn set(&mut self, addr: usize, slot: Slot) {
        let (key, index) = self.locate(addr);
        let slots_per_page = 1usize << self.slot_shift;
        let page = self
            .pages
            .entry(key)
            .or_insert_with(|| vec![Slot::Vacant; slots_per_page].into_boxed_slice());
        page[index] = slot;
    }

    /// Register a slab: its first page names the pool, later pages step back
    /// to it.
    pub(crate) fn register_pool(&mut self, base: usize, os_bytes: usize, handle: PoolHandle) {
        let page = self.page_size();
        debug_assert!(base.is_multiple_of(page));
        self.set(base, Slot::Pool(handle));
        let pages = os_bytes.div_ceil(page);
        for n in 1..pages {
            #[allow(clippy::cast_possible_truncation)]
            self.set(base + n * page, Slot::Trailing(n as u32));
        }
    }

    pub(crate) fn register_os(&mut self, base: usize, requested: usize, os_bytes: usize) {
        debug_assert!(base.is_multiple_of(self.page_size()));
        self.set(base, Slot::Os { requested, os_bytes });
    }

    /// Record a new requested size for an in-place large reallocation.
    pub(crate) fn update_os(&mut self, base: usize, requested: usize) {
        let (key, index) = self.locate(base);
        if let Some(page) = self.pages.get_mut(&key)
            && let Slot::Os { requested: old, .. } = &mut page[index]
        {
            *old = requested;
        } else {
            debug_assert!(false, "update_os on {base:#x}, which is not an OS allocation");
        }
    }

    /// Reset every slot covering `[base, base + bytes)` to vacant. Slot pages
    /// themselves stay allocated.
    pub(crate) fn vacate(&mut self, base: usize, bytes: usize) {
        let page = self.page_size();
        for n in 0..bytes.div_ceil(page).max(1) {
            let (key, index) = self.locate(base + n * page);
            if let Some(slots) = self.pages.get_mut(&key) {
                slots[index] = Slot::Vacant;
            }
        }
    }

    /// Resolve any address inside a pooled slab, or the base address of an
    /// OS allocation.
    #[inline]
    pub(crate) fn resolve(&self, addr: usize) -> Option<Owner> {
        let page = addr & !(self.page_size() - 1);
        match self.get(page) {
            Slot::Vacant => None,
            Slot::Pool(handle) => Some(Owner::Pool { handle, base: page }),
            Slot::Os { requested, os_bytes } => Some(Owner::Os {
                base: page,
                requested,
                os_bytes,
            }),
            Slot::Trailing(n) => {
                let head = page - ((n as usize) << self.page_shift);
                match self.get(head) {
                    Slot::Pool(handle) => Some(Owner::Pool { handle, base: head }),
                    other => {
                        debug_assert!(
                            false,
                            "trailing slot at {page:#x} points back to {head:#x}, which holds {other:?}"
                        );
                        None
                    }
                }
            }
        }
    }

    /// Number of slot pages ever created.
    pub(crate) fn slot_pages(&self) -> usize {
        self.pages.len()
    }

    /// Every live direct OS allocation as `(base, requested, os_bytes)`.
    pub(crate) fn os_allocations(&self) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
        let (page_shift, slot_shift) = (self.page_shift, self.slot_shift);
        self.pages.iter().flat_map(move |(&key, slots)| {
            slots.iter().enumerate().filter_map(move |(index, slot)| match *slot {
                Slot::Os { requested, os_bytes } => {
                    Some((((key << slot_shift) | index) << page_shift, requested, os_bytes))
                }
                _ => None,
            })
        })
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    const PAGE: usize = 4096;

    fn handle(index: u32) -> PoolHandle {
        PoolHandle { table: 3, index }
    }

    fn table() -> IndirectTable {
        IndirectTable::new(PAGE, 1 << 40)
    }

    #[test]
    fn test_resolve_interior_pointers_of_slab() {
        let mut t = table();
        let base = 0x7f00_0000_0000;
        t.register_pool(base, 16 * PAGE, handle(9));
        for offset in [0, 17, PAGE, 5 * PAGE + 123, 16 * PAGE - 1] {
            assert_eq!(
                t.resolve(base + offset),
                Some(Owner::Pool { handle: handle(9), base }),
                "offset {offset}"
            );
        }
        assert_eq!(t.resolve(base + 16 * PAGE), None);
        assert_eq!(t.resolve(base - 1), None);
    }

    #[test]
    fn test_slab_spanning_two_slot_pages() {
        let mut t = table();
        let slots_per_page = 1usize << t.slot_shift;
        // Start four pages before a slot-page boundary.
        let base = (0x1234 * slots_per_page + slots_per_page - 4) * PAGE;
        t.register_pool(base, 16 * PAGE, handle(1));
        assert_eq!(t.slot_pages(), 2);
        assert_eq!(
            t.resolve(base + 10 * PAGE + 8),
            Some(Owner::Pool { handle: handle(1), base })
        );
    }

    #[test]
    fn test_os_entry_and_update() {
        let mut t = table();
        let base = 0x5555_0000_0000;
        t.register_os(base, 100_000, 102_400);
        assert_eq!(
            t.resolve(base),
            Some(Owner::Os { base, requested: 100_000, os_bytes: 102_400 })
        );
        t.update_os(base, 90_000);
        assert_eq!(
            t.resolve(base),
            Some(Owner::Os { base, requested: 90_000, os_bytes: 102_400 })
        );
        assert_eq!(t.os_allocations().collect::<Vec<_>>(), vec![(base, 90_000, 102_400)]);
    }

    #[test]
    fn test_vacate_keeps_slot_pages() {
        let mut t = table();
        let base = 0x2000_0000;
        t.register_pool(base, 16 * PAGE, handle(2));
        let pages = t.slot_pages();
        t.vacate(base, 16 * PAGE);
        assert_eq!(t.resolve(base), None);
        assert_eq!(t.resolve(base + 3 * PAGE), None);
        assert_eq!(t.slot_pages(), pages);

        // Recycled slot reused by a different owner.
        t.register_os(base, 4096, 4096);
        assert!(matches!(t.resolve(base), Some(Owner::Os { .. })));
    }

    #[test]
    fn test_unknown_address_is_vacant() {
        let t = table();
        assert_eq!(t.resolve(0xdead_0000), None);
        assert_eq!(t.slot_pages(), 0);
    }

    #[test]
    fn test_large_page_size_layout() {
        let mut t = IndirectTable::new(64 * 1024, 1 << 36);
        let base = 0x40_0000_0000;
        t.register_pool(base, 3 * 64 * 1024, handle(41));
        assert_eq!(
            t.resolve(base + 2 * 64 * 1024 + 5),
            Some(Owner::Pool { handle: handle(41), base })
        );
    }
}
