//! Intrusive free-block runs overlaid on unused pool memory.
//!
//! This module is the only code that reads or writes allocator metadata
//! inside block memory. Everything above it works with [`FreeList`] and
//! never dereferences a block.

use std::ptr::NonNull;

/// Header written into the first bytes of a free run: `count` contiguous free
/// blocks start here, and `next` links to the following run.
#[repr(C)]
pub(crate) struct FreeMem {
    next: *mut FreeMem,
    count: u32,
}

/// Singly linked list of free runs belonging to one pool.
pub(crate) struct FreeList {
    head: Option<NonNull<FreeMem>>,
}

impl FreeList {
    /// A list holding one run of `blocks` blocks starting at `base`.
    ///
    /// # Safety
    /// `base` must be valid for writes of a `FreeMem`, aligned to 8, and the
    /// first of `blocks` consecutive unused blocks.
    pub(crate) unsafe fn with_run(base: NonNull<u8>, blocks: u32) -> Self {
        debug_assert!(blocks > 0);
        let node = base.cast::<FreeMem>();
        // Safety: upheld by caller.
        unsafe {
            node.as_ptr().write(FreeMem {
                next: std::ptr::null_mut(),
                count: blocks,
            });
        }
        Self { head: Some(node) }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Address of the first run, if any.
    #[cfg(test)]
    pub(crate) fn head(&self) -> Option<NonNull<u8>> {
        self.head.map(NonNull::cast)
    }

    /// Take the last block of the head run. When the run empties, the head
    /// moves to the next run.
    ///
    /// # Safety
    /// Every run on the list must have been written by this list, and
    /// `block_size` must be the size the runs were built with.
    #[inline]
    pub(crate) unsafe fn pop(&mut self, block_size: usize) -> Option<NonNull<u8>> {
        let run = self.head?;
        let node = run.as_ptr();
        // Safety: node is a live FreeMem header (caller contract). The block
        // returned is inside the run, and when it is the header itself the
        // `next` link has already been read.
        unsafe {
            debug_assert!((*node).count > 0, "free run at {node:p} has zero count");
            (*node).count -= 1;
            let index = (*node).count as usize;
            if index == 0 {
                self.head = NonNull::new((*node).next);
            }
            Some(run.cast::<u8>().add(index * block_size))
        }
    }

    /// Push `block` as a new single-block run.
    ///
    /// # Safety
    /// `block` must be an unused block of this list's pool, at least 16 bytes
    /// and aligned to 8.
    #[inline]
    pub(crate) unsafe fn push(&mut self, block: NonNull<u8>) {
        let node = block.cast::<FreeMem>();
        // Safety: upheld by caller.
        unsafe {
            node.as_ptr().write(FreeMem {
                next: self.head.map_or(std::ptr::null_mut(), NonNull::as_ptr),
                count: 1,
            });
        }
        self.head = Some(node);
    }

    /// Walk the runs as `(address, count)` pairs, stopping after `limit`
    /// runs so a corrupted cycle cannot loop forever.
    ///
    /// # Safety
    /// Same as [`pop`](Self::pop): every run must be a live header.
    pub(crate) unsafe fn runs(&self, limit: usize) -> Vec<(NonNull<u8>, u32)> {
        let mut out = Vec::new();
        let mut cursor = self.head;
        while let Some(node) = cursor {
            if out.len() == limit {
                break;
            }
            // Safety: node is a live header (caller contract).
            let (next, count) = unsafe { ((*node.as_ptr()).next, (*node.as_ptr()).count) };
            out.push((node.cast::<u8>(), count));
            cursor = NonNull::new(next);
        }
        out
    }

    /// Overwrite the head run's count. Lets tests fake heap corruption.
    ///
    /// # Safety
    /// The list must be non-empty with a live head header.
    #[cfg(test)]
    pub(crate) unsafe fn corrupt_head_count(&mut self, count: u32) {
        if let Some(node) = self.head {
            // Safety: upheld by caller.
            unsafe { (*node.as_ptr()).count = count };
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    const BLOCK: usize = 16;

    fn arena(blocks: usize) -> Vec<u128> {
        vec![0u128; blocks * BLOCK / std::mem::size_of::<u128>()]
    }

    fn base(buf: &mut [u128]) -> NonNull<u8> {
        NonNull::new(buf.as_mut_ptr().cast::<u8>()).unwrap()
    }

    #[test]
    fn test_pop_takes_from_end_of_run() {
        let mut buf = arena(4);
        let base = base(&mut buf);
        // Safety: Test code; buf outlives the list.
        unsafe {
            let mut list = FreeList::with_run(base, 4);
            for i in (0..4).rev() {
                let block = list.pop(BLOCK).unwrap();
                assert_eq!(block.as_ptr(), base.as_ptr().add(i * BLOCK));
            }
            assert!(list.is_empty());
            assert!(list.pop(BLOCK).is_none());
        }
    }

    #[test]
    fn test_push_then_pop_is_lifo() {
        let mut buf = arena(4);
        let base = base(&mut buf);
        // Safety: Test code.
        unsafe {
            let mut list = FreeList::with_run(base, 4);
            let a = list.pop(BLOCK).unwrap();
            let b = list.pop(BLOCK).unwrap();
            list.push(a);
            list.push(b);
            assert_eq!(list.head(), Some(b));
            assert_eq!(list.pop(BLOCK), Some(b));
            assert_eq!(list.pop(BLOCK), Some(a));
            // The first run still has two blocks left.
            assert_eq!(list.runs(8), vec![(base, 2)]);
        }
    }

    #[test]
    fn test_runs_reports_counts() {
        let mut buf = arena(8);
        let base = base(&mut buf);
        // Safety: Test code.
        unsafe {
            let mut list = FreeList::with_run(base, 8);
            let top = list.pop(BLOCK).unwrap();
            list.push(top);
            let runs = list.runs(16);
            assert_eq!(runs.len(), 2);
            assert_eq!(runs[0], (top, 1));
            assert_eq!(runs[1], (base, 7));
            assert_eq!(list.runs(1).len(), 1);
        }
    }

    #[test]
    fn test_head_run_exhaustion_advances_to_next() {
        let mut buf = arena(3);
        let base = base(&mut buf);
        // Safety: Test code.
        unsafe {
            let mut list = FreeList::with_run(base, 3);
            let last = list.pop(BLOCK).unwrap();
            list.push(last);
            // Head is the single-block run; popping it must reveal the old run.
            assert_eq!(list.pop(BLOCK), Some(last));
            assert_eq!(list.head(), Some(base));
            assert_eq!(list.runs(4), vec![(base, 2)]);
        }
    }
}
