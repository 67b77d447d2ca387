use std::fmt;
use std::io;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum VmError {
    ReservationFailed(io::Error),
    ReleaseFailed(io::Error),
    InitializationFailed(String),
    /// The OS could not supply `size` bytes even after the free-block cache
    /// was flushed.
    OutOfMemory { size: usize, align: usize },
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::ReservationFailed(e) => write!(f, "VM reservation failed: {e}"),
            VmError::ReleaseFailed(e) => write!(f, "VM release failed: {e}"),
            VmError::InitializationFailed(msg) => write!(f, "allocator initialization failed: {msg}"),
            VmError::OutOfMemory { size, align } => {
                write!(f, "out of memory: {size} bytes (align {align}) could not be mapped")
            }
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::ReservationFailed(e) | VmError::ReleaseFailed(e) => Some(e),
            VmError::InitializationFailed(_) | VmError::OutOfMemory { .. } => None,
        }
    }
}

/// Page-level OS memory provider.
///
/// Implementations are stateless: the allocator is generic over the provider
/// type and calls these as associated functions. Tests substitute providers
/// that count calls or inject failures.
pub trait VmOps {
    /// Map `size` bytes of readable, writable memory whose base is a multiple
    /// of `align`.
    ///
    /// # Safety
    /// `size` must be non-zero and `align` a power of two no larger than
    /// 64 KiB. The returned range must eventually be passed to
    /// [`release`](Self::release) with the same `size`.
    unsafe fn reserve_and_commit(size: usize, align: usize) -> Result<NonNull<u8>, VmError>;

    /// Return a range obtained from [`reserve_and_commit`](Self::reserve_and_commit)
    /// to the OS.
    ///
    /// # Safety
    /// `ptr`/`size` must describe exactly one live mapping from this provider.
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size.
    fn page_size() -> usize;
}

pub struct PlatformVmOps;

#[cfg(all(any(target_os = "macos", target_os = "linux"), not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::io;

    unsafe fn map(size: usize) -> Result<NonNull<u8>, VmError> {
        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(VmError::ReservationFailed(io::Error::last_os_error()));
        }

        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| VmError::ReservationFailed(io::Error::other("mmap returned null")))
    }

    unsafe fn unmap(addr: usize, size: usize) -> Result<(), VmError> {
        // Safety: FFI call to munmap; caller passes a mapped sub-range.
        if unsafe { libc::munmap(addr as *mut libc::c_void, size) } != 0 {
            return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
        }
        Ok(())
    }

    impl VmOps for PlatformVmOps {
        unsafe fn reserve_and_commit(size: usize, align: usize) -> Result<NonNull<u8>, VmError> {
            let os_page = Self::page_size();
            if align <= os_page {
                // Safety: size is non-zero (caller contract).
                return unsafe { map(size) };
            }

            // mmap only guarantees OS-page alignment. Over-map by the worst
            // case padding and unmap the unaligned head and tail.
            let total = size + align - os_page;
            // Safety: total is non-zero.
            let base = unsafe { map(total)? };
            let base_addr = base.as_ptr() as usize;
            let aligned_addr = (base_addr + align - 1) & !(align - 1);
            let head = aligned_addr - base_addr;
            let tail = total - head - size;

            // Safety: head and tail are OS-page multiples inside the mapping
            // we just created, disjoint from [aligned_addr, aligned_addr + size).
            unsafe {
                if head > 0 {
                    unmap(base_addr, head)?;
                }
                if tail > 0 {
                    unmap(aligned_addr + size, tail)?;
                }
            }

            // Safety: aligned_addr lies inside a successful mapping.
            Ok(unsafe { NonNull::new_unchecked(aligned_addr as *mut u8) })
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: ptr/size describe a mapping from reserve_and_commit.
            unsafe { unmap(ptr.as_ptr() as usize, size) }
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // 64-bit only: a positive c_long always fits in usize.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

#[cfg(all(target_os = "windows", not(any(loom, miri))))]
mod windows {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::ffi::c_void;
    use std::io;

    const MEM_COMMIT: u32 = 0x0000_1000;
    const MEM_RESERVE: u32 = 0x0000_2000;
    const MEM_RELEASE: u32 = 0x0000_8000;
    const PAGE_READWRITE: u32 = 0x04;

    #[repr(C)]
    #[allow(non_snake_case)]
    struct SystemInfo {
        wProcessorArchitecture: u16,
        wReserved: u16,
        dwPageSize: u32,
        lpMinimumApplicationAddress: *mut c_void,
        lpMaximumApplicationAddress: *mut c_void,
        dwActiveProcessorMask: usize,
        dwNumberOfProcessors: u32,
        dwProcessorType: u32,
        dwAllocationGranularity: u32,
        wProcessorLevel: u16,
        wProcessorRevision: u16,
    }

    #[link(name = "kernel32")]
    unsafe extern "system" {
        fn VirtualAlloc(addr: *mut c_void, size: usize, kind: u32, protect: u32) -> *mut c_void;
        fn VirtualFree(addr: *mut c_void, size: usize, kind: u32) -> i32;
        fn GetSystemInfo(info: *mut SystemInfo);
    }

    fn system_info() -> &'static (usize, usize) {
        use crate::sync::OnceLock;
        static INFO: OnceLock<(usize, usize)> = OnceLock::new();
        INFO.get_or_init(|| {
            let mut info = std::mem::MaybeUninit::<SystemInfo>::zeroed();
            // Safety: FFI call to GetSystemInfo; it fills the whole struct.
            let info = unsafe {
                GetSystemInfo(info.as_mut_ptr());
                info.assume_init()
            };
            (info.dwPageSize as usize, info.dwAllocationGranularity as usize)
        })
    }

    impl VmOps for PlatformVmOps {
        unsafe fn reserve_and_commit(size: usize, align: usize) -> Result<NonNull<u8>, VmError> {
            // VirtualAlloc bases are aligned to the allocation granularity
            // (64 KiB), which covers every supported alignment.
            debug_assert!(
                align <= system_info().1,
                "alignment {align} exceeds the allocation granularity {}",
                system_info().1
            );
            // Safety: FFI call to VirtualAlloc.
            let ptr = unsafe {
                VirtualAlloc(std::ptr::null_mut(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE)
            };
            NonNull::new(ptr.cast::<u8>())
                .ok_or_else(|| VmError::ReservationFailed(io::Error::last_os_error()))
        }

        unsafe fn release(ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
            // MEM_RELEASE takes the base address and a zero size.
            // Safety: FFI call to VirtualFree.
            if unsafe { VirtualFree(ptr.as_ptr().cast::<c_void>(), 0, MEM_RELEASE) } == 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            system_info().0
        }
    }
}

// ---------------------------------------------------------------------------
// Heap-backed mock for loom and Miri
//
// Neither can issue real VM syscalls. Every mapping is a plain heap block
// aligned to the largest supported page size, so any configured alignment is
// honoured.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
const MOCK_ALIGN: usize = 64 * 1024;

#[cfg(any(loom, miri))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve_and_commit(size: usize, align: usize) -> Result<NonNull<u8>, VmError> {
        debug_assert!(align <= MOCK_ALIGN);
        if size == 0 {
            return Err(VmError::ReservationFailed(io::Error::new(
                io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, MOCK_ALIGN)
            .map_err(|e| VmError::ReservationFailed(io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, MOCK_ALIGN)
            .map_err(|e| VmError::ReleaseFailed(io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}
