//! Fixed size-class table and the O(1) size-to-class lookup.

/// Minimum alignment of every allocation. Also the smallest block size: a
/// free block must hold a [`FreeMem`](super::free_list::FreeMem) node.
pub(crate) const DEFAULT_ALIGNMENT: usize = 16;

/// Largest page size the allocator accepts.
pub(crate) const PAGE_SIZE_LIMIT: usize = 64 * 1024;

/// Pooling ceiling. Requests at or above it skip the small pools.
pub(crate) const BINNED_SIZE_LIMIT: usize = PAGE_SIZE_LIMIT / 2;

/// Block sizes of the small pool tables. Every entry is a multiple of 16 and
/// chosen to keep per-slab tail waste low for a 64 KiB slab.
pub(crate) const SIZE_CLASSES: [usize; 41] = [
    16, 32, 48, 64, 80, 96, 112, 128, 160, 192, 224, 256, 288, 320, 384, 448, 512, 576, 640, 704,
    768, 896, 1024, 1168, 1360, 1632, 2048, 2336, 2720, 3264, 4096, 4672, 5456, 6544, 8192, 9360,
    10912, 13104, 16384, 21840, 32768,
];

pub(crate) const POOL_COUNT: usize = SIZE_CLASSES.len();

/// Extra tables used only with 64 KiB pages: `(block_size, slab_pages)`.
/// The first covers `[32 KiB, 48 KiB]`, the second `(64 KiB, 96 KiB]`.
pub(crate) const PAGE_POOL_CLASSES: [(usize, usize); 2] = [
    (BINNED_SIZE_LIMIT + BINNED_SIZE_LIMIT / 2, 3),
    (PAGE_SIZE_LIMIT + BINNED_SIZE_LIMIT, 6),
];

const LUT_LEN: usize = BINNED_SIZE_LIMIT / 16 + 1;

/// Size-to-class table indexed by `ceil(size / 16)`. All classes are 16-byte
/// multiples, so each byte value below the ceiling resolves exactly.
static SIZE_CLASS_LUT: [u8; LUT_LEN] = build_size_class_lut();

const fn build_size_class_lut() -> [u8; LUT_LEN] {
    let mut table = [0u8; LUT_LEN];
    // table[0] stays 0: a zero-byte request gets the smallest class.
    let mut q: usize = 1;
    let mut sc: usize = 0;
    while sc < POOL_COUNT {
        let class_quanta = SIZE_CLASSES[sc] / 16;
        while q <= class_quanta && q < LUT_LEN {
            #[allow(clippy::cast_possible_truncation)]
            {
                table[q] = sc as u8;
            }
            q += 1;
        }
        sc += 1;
    }
    table
}

/// Apply the default alignment and round `size` up to a multiple of it.
///
/// Returns `None` when the rounded size overflows `usize`.
#[inline]
pub(crate) fn normalize(size: usize, align: usize) -> Option<(usize, usize)> {
    let align = align.max(DEFAULT_ALIGNMENT);
    let size = size.checked_next_multiple_of(align)?.max(align);
    Some((size, align))
}

/// Smallest small-pool class that holds `size` and whose block size is a
/// multiple of `align`. `None` means the request takes another path.
#[inline]
pub(crate) fn pooled_class(size: usize, align: usize) -> Option<usize> {
    if size >= BINNED_SIZE_LIMIT {
        return None;
    }
    let mut idx = SIZE_CLASS_LUT[(size + 15) >> 4] as usize;
    while idx < POOL_COUNT {
        if SIZE_CLASSES[idx].is_multiple_of(align) {
            return Some(idx);
        }
        idx += 1;
    }
    None
}

/// Shape of one pool table: its block size and how many bytes each slab
/// requests from the OS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TableLayout {
    pub block_size: usize,
    pub slab_bytes: usize,
}

/// Every table for the given page and pool sizes, small classes first.
pub(crate) fn table_layouts(page_size: usize, pool_size: usize) -> Vec<TableLayout> {
    let mut layouts: Vec<TableLayout> = SIZE_CLASSES
        .iter()
        .map(|&block_size| TableLayout {
            block_size,
            slab_bytes: pool_size,
        })
        .collect();
    if page_size == PAGE_SIZE_LIMIT {
        layouts.extend(PAGE_POOL_CLASSES.iter().map(|&(block_size, pages)| TableLayout {
            block_size,
            slab_bytes: pages * page_size,
        }));
    }
    layouts
}

/// Table index for a normalized `(size, align)`, or `None` for a direct OS
/// allocation. `page_pools` is true when the page pools exist.
#[inline]
pub(crate) fn select_table(size: usize, align: usize, page_pools: bool) -> Option<usize> {
    if let Some(idx) = pooled_class(size, align) {
        return Some(idx);
    }
    if page_pools && align == DEFAULT_ALIGNMENT {
        let (first, _) = PAGE_POOL_CLASSES[0];
        let (second, _) = PAGE_POOL_CLASSES[1];
        if (BINNED_SIZE_LIMIT..=first).contains(&size) {
            return Some(POOL_COUNT);
        }
        if size > PAGE_SIZE_LIMIT && size <= second {
            return Some(POOL_COUNT + 1);
        }
    }
    None
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn linear_class(size: usize) -> usize {
        SIZE_CLASSES.iter().position(|&c| c >= size).unwrap()
    }

    #[test]
    fn test_classes_are_sorted_and_16_aligned() {
        assert!(SIZE_CLASSES[0] >= std::mem::size_of::<super::super::free_list::FreeMem>());
        for pair in SIZE_CLASSES.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
        for &c in &SIZE_CLASSES {
            assert!(c.is_multiple_of(16), "class {c} is not a multiple of 16");
        }
        assert_eq!(*SIZE_CLASSES.last().unwrap(), BINNED_SIZE_LIMIT);
    }

    #[test]
    fn test_lut_matches_linear_search() {
        for size in 1..BINNED_SIZE_LIMIT {
            let idx = pooled_class(size, 1).unwrap();
            assert_eq!(idx, linear_class(size), "size {size}");
            assert!(SIZE_CLASSES[idx] >= size);
        }
    }

    #[test]
    fn test_zero_size_gets_smallest_class() {
        assert_eq!(pooled_class(0, 1), Some(0));
        let (size, align) = normalize(0, 0).unwrap();
        assert_eq!((size, align), (16, 16));
        assert_eq!(pooled_class(size, align), Some(0));
    }

    #[test]
    fn test_exact_sixteen_byte_class() {
        let (size, align) = normalize(16, 8).unwrap();
        let idx = pooled_class(size, align).unwrap();
        assert_eq!(SIZE_CLASSES[idx], 16);
    }

    #[test]
    fn test_alignment_bumps_to_aligned_class() {
        // 1100 rounds to 1120 -> 1168, which is not 32-aligned, nor is 1360.
        let (size, align) = normalize(1100, 32).unwrap();
        assert_eq!(size, 1120);
        let idx = pooled_class(size, align).unwrap();
        assert_eq!(SIZE_CLASSES[idx], 1632);

        let (size, align) = normalize(65, 64).unwrap();
        assert_eq!(SIZE_CLASSES[pooled_class(size, align).unwrap()], 128);

        // Size bigger than the alignment, yet the class must still divide.
        let (size, align) = normalize(3000, 4096).unwrap();
        assert_eq!(size, 4096);
        assert_eq!(SIZE_CLASSES[pooled_class(size, align).unwrap()], 4096);
    }

    #[test]
    fn test_every_aligned_class_divides_alignment() {
        for align_shift in 4..=12 {
            let align = 1usize << align_shift;
            for size in (1..BINNED_SIZE_LIMIT).step_by(97) {
                let (s, a) = normalize(size, align).unwrap();
                if let Some(idx) = pooled_class(s, a) {
                    assert!(SIZE_CLASSES[idx] >= size);
                    assert!(SIZE_CLASSES[idx].is_multiple_of(align));
                }
            }
        }
    }

    #[test]
    fn test_ceiling_bypasses_pools() {
        assert_eq!(pooled_class(BINNED_SIZE_LIMIT, 16), None);
        assert_eq!(pooled_class(100_000, 16), None);
        assert_eq!(select_table(100_000, 16, false), None);
        assert_eq!(select_table(100_000, 16, true), None);
    }

    #[test]
    fn test_page_pools_only_with_default_alignment() {
        assert_eq!(select_table(BINNED_SIZE_LIMIT, 16, true), Some(POOL_COUNT));
        assert_eq!(select_table(49152, 16, true), Some(POOL_COUNT));
        assert_eq!(select_table(49168, 16, true), None);
        assert_eq!(select_table(65536, 16, true), None);
        assert_eq!(select_table(65552, 16, true), Some(POOL_COUNT + 1));
        assert_eq!(select_table(98304, 16, true), Some(POOL_COUNT + 1));
        assert_eq!(select_table(40000, 32, true), None);
        assert_eq!(select_table(BINNED_SIZE_LIMIT, 16, false), None);
    }

    #[test]
    fn test_table_layouts() {
        let small = table_layouts(4096, 64 * 1024);
        assert_eq!(small.len(), POOL_COUNT);
        assert!(small.iter().all(|l| l.slab_bytes == 64 * 1024));

        let big = table_layouts(PAGE_SIZE_LIMIT, 64 * 1024);
        assert_eq!(big.len(), POOL_COUNT + 2);
        assert_eq!(big[POOL_COUNT], TableLayout { block_size: 49152, slab_bytes: 3 * 65536 });
        assert_eq!(big[POOL_COUNT + 1], TableLayout { block_size: 98304, slab_bytes: 6 * 65536 });
    }

    #[test]
    fn test_normalize_overflow() {
        assert!(normalize(usize::MAX, 16).is_none());
    }
}
