//! Lock-free queue of frees postponed to the next locked operation.
//!
//! `push` threads the block onto a Treiber stack through the block's first
//! word. Only whole-stack `swap` detaches nodes, so a node is never popped
//! while another thread reads its link and the stack needs no ABA tag.

use crate::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::ptr::NonNull;

pub(crate) struct PendingFrees {
    head: AtomicPtr<u8>,
    flushing: AtomicBool,
}

/// Clears the `flushing` flag even if a free panics mid-drain.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl PendingFrees {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(std::ptr::null_mut()),
            flushing: AtomicBool::new(false),
        }
    }

    /// Queue `block` for a later [`drain`](Self::drain).
    ///
    /// # Safety
    /// `block` must be a live allocation of at least one pointer width,
    /// pointer-aligned, and the caller gives up all access to it.
    pub(crate) unsafe fn push(&self, block: NonNull<u8>) {
        let node = block.as_ptr();
        let link = node.cast::<*mut u8>();
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // Safety: the block is ours until the CAS publishes it.
            unsafe { link.write(head) };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Detach every queued block and pass each to `free`, newest first.
    ///
    /// Returns the number of blocks freed. A drain started while another is
    /// running (including from inside `free`) frees nothing and returns 0.
    pub(crate) fn drain(&self, mut free: impl FnMut(NonNull<u8>)) -> usize {
        if self.flushing.swap(true, Ordering::Acquire) {
            return 0;
        }
        let _guard = FlushGuard(&self.flushing);

        let mut cursor = self.head.swap(std::ptr::null_mut(), Ordering::Acquire);
        let mut freed = 0;
        while let Some(node) = NonNull::new(cursor) {
            // Safety: push wrote the link before the Release CAS that
            // published the node, and our Acquire swap synchronizes with it.
            cursor = unsafe { node.as_ptr().cast::<*mut u8>().read() };
            free(node);
            freed += 1;
        }
        freed
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::{Arc, thread};

    fn block() -> NonNull<u8> {
        NonNull::from(Box::leak(Box::new([0u64; 2]))).cast()
    }

    fn reclaim(ptr: NonNull<u8>) {
        // Safety: Test code; every queued block came from `block()`.
        drop(unsafe { Box::from_raw(ptr.cast::<[u64; 2]>().as_ptr()) });
    }

    #[test]
    fn test_drain_returns_pushed_blocks_newest_first() {
        let pending = PendingFrees::new();
        let blocks: Vec<_> = (0..3).map(|_| block()).collect();
        for &b in &blocks {
            // Safety: Test code.
            unsafe { pending.push(b) };
        }
        assert!(!pending.is_empty());

        let mut seen = Vec::new();
        assert_eq!(pending.drain(|p| seen.push(p)), 3);
        assert_eq!(seen, blocks.iter().rev().copied().collect::<Vec<_>>());
        assert!(pending.is_empty());
        seen.into_iter().for_each(reclaim);
    }

    #[test]
    fn test_nested_drain_is_refused() {
        let pending = PendingFrees::new();
        // Safety: Test code.
        unsafe { pending.push(block()) };
        let mut inner = None;
        let freed = pending.drain(|p| {
            inner = Some(pending.drain(|_| unreachable!()));
            reclaim(p);
        });
        assert_eq!(freed, 1);
        assert_eq!(inner, Some(0));
        // Flag is cleared again.
        assert_eq!(pending.drain(|_| unreachable!()), 0);
    }

    #[test]
    fn test_concurrent_push_then_drain() {
        let pending = Arc::new(PendingFrees::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pending = pending.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        // Safety: Test code.
                        unsafe { pending.push(block()) };
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pending.drain(reclaim), 1000);
    }
}
