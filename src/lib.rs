#[cfg(not(target_pointer_width = "64"))]
compile_error!("binalloc supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// allocator
pub use memory::binned::{BinnedAllocator, BinnedAllocatorConfig, LockingStrategy};
pub use memory::malloc::Malloc;

// stats
pub use memory::stats::{AllocatorStats, Counter, TOTAL_CACHED_BYTES, TOTAL_OS_BYTES};

// OS layer/errors
pub use memory::vm::{PlatformVmOps, VmError, VmOps};
