//! Platform virtual-memory primitives for code-region reservation.
//!
//! The cache reserves its entire address window once at startup
//! (mmap/VirtualAlloc) and releases it only when the owning
//! [`AddressRange`](crate::AddressRange) is dropped. Pages are mapped
//! read-write and committed lazily by the OS; write-xor-execute transitions
//! are the compiler backend's concern, not the cache's.

#[cfg(unix)]
mod platform {
    use std::ptr;

    /// Reserve `size` bytes of read-write anonymous memory.
    pub unsafe fn reserve_rw(size: usize) -> *mut u8 {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            ptr::null_mut()
        } else {
            ptr as *mut u8
        }
    }

    /// Release a reservation made by `reserve_rw`.
    pub unsafe fn release(ptr: *mut u8, size: usize) {
        unsafe {
            libc::munmap(ptr as *mut _, size);
        }
    }

    /// Get the system page size.
    pub fn page_size() -> usize {
        // SAFETY: sysconf is safe to call with _SC_PAGESIZE
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }
}

#[cfg(windows)]
mod platform {
    use std::ptr;
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
    };

    /// Reserve `size` bytes of read-write memory.
    pub unsafe fn reserve_rw(size: usize) -> *mut u8 {
        unsafe {
            VirtualAlloc(ptr::null(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) as *mut u8
        }
    }

    /// Release a reservation made by `reserve_rw`.
    pub unsafe fn release(ptr: *mut u8, _size: usize) {
        unsafe {
            VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
        }
    }

    /// Get the system page size.
    pub fn page_size() -> usize {
        use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
        // SAFETY: SYSTEM_INFO can be zero-initialized and GetSystemInfo always succeeds
        let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
        unsafe { GetSystemInfo(&mut info) };
        info.dwPageSize as usize
    }
}

pub use platform::{release, reserve_rw};

/// Get the system page size.
#[inline]
pub fn page_size() -> usize {
    platform::page_size()
}

/// Align a size up to the nearest page boundary.
#[inline]
pub fn page_align(size: usize) -> usize {
    let page = page_size();
    (size + page - 1) & !(page - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_power_of_two() {
        let page = page_size();
        assert!(page >= 4096);
        assert!(page.is_power_of_two());
    }

    #[test]
    fn test_page_align() {
        let page = page_size();
        assert_eq!(page_align(1), page);
        assert_eq!(page_align(page), page);
        assert_eq!(page_align(page + 1), 2 * page);
    }

    #[test]
    fn test_reserve_and_release() {
        let size = page_align(64 * 1024);
        let ptr = unsafe { reserve_rw(size) };
        assert!(!ptr.is_null());

        // Pages are committed lazily; a write must succeed.
        unsafe {
            ptr.write(0xAB);
            assert_eq!(ptr.read(), 0xAB);
            release(ptr, size);
        }
    }
}
