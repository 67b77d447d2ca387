use std::fmt;
use std::ptr::NonNull;

/// General-purpose allocator contract consumed by the rest of the process.
///
/// An `align` of 0 means the default alignment (16). Sizes and alignments
/// follow the same rules as [`BinnedAllocator`](super::binned::BinnedAllocator).
pub trait Malloc: Send + Sync {
    /// Allocate `size` bytes. Never returns null; running out of memory is
    /// fatal.
    fn malloc(&self, size: usize, align: usize) -> NonNull<u8>;

    /// Resize `ptr`. `None` behaves as [`malloc`](Self::malloc), a zero
    /// `new_size` frees `ptr` and returns `None`.
    ///
    /// # Safety
    /// `ptr` must be a live allocation of this allocator. It must not be
    /// used after the call unless the same pointer is returned.
    unsafe fn realloc(&self, ptr: Option<NonNull<u8>>, new_size: usize, align: usize) -> Option<NonNull<u8>>;

    /// # Safety
    /// `ptr` must be a live allocation of this allocator.
    unsafe fn free(&self, ptr: NonNull<u8>);

    /// Usable size of `ptr`, or `None` if this allocator does not own it.
    ///
    /// # Safety
    /// `ptr` must not be released concurrently.
    unsafe fn get_allocation_size(&self, ptr: NonNull<u8>) -> Option<usize>;

    /// Check internal invariants. `false` means the heap is corrupt.
    fn validate_heap(&self) -> bool;

    /// Write a human-readable usage report.
    fn dump_allocations(&self, sink: &mut dyn fmt::Write) -> fmt::Result;

    /// Return cached memory to the OS.
    fn trim(&self) {}
}
