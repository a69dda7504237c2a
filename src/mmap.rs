//! Low-level reservation, commit and protection of code address space.

use anyhow::{Context, Result};

/// Page permissions used for committed code pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Permission {
    ReadWrite,
    ReadExecute,
    ReadWriteExecute,
}

impl Permission {
    fn as_region(self) -> region::Protection {
        match self {
            Permission::ReadWrite => region::Protection::READ_WRITE,
            Permission::ReadExecute => region::Protection::READ_EXECUTE,
            Permission::ReadWriteExecute => region::Protection::READ_WRITE_EXECUTE,
        }
    }
}

/// One contiguous reservation of virtual address space for code.
///
/// The reservation starts out inaccessible; pages become usable once
/// `commit_pages` transitions them to backed, accessible memory. The
/// whole reservation is released when the value is dropped.
#[derive(Debug)]
pub struct VirtualMemory {
    // Stored as a `usize` instead of a raw pointer so the type is
    // naturally `Send` and `Sync`; the coordination all happens at the
    // OS layer.
    ptr: usize,
    len: usize,
}

impl VirtualMemory {
    /// Reserve `size` bytes of address space with no access permissions,
    /// preferably at `hint`. `size` must be a multiple of the page size.
    /// The hint is best-effort; the OS picks another address if the
    /// requested one is unavailable.
    #[cfg(unix)]
    pub fn reserve(size: usize, hint: Option<usize>) -> Result<Self> {
        assert!(size > 0);
        assert_eq!(size & (page_size() - 1), 0);

        let addr = hint.unwrap_or(0) as *mut libc::c_void;
        let ptr = unsafe {
            libc::mmap(
                addr,
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error())
                .context(format!("mmap failed to reserve {size:#x} bytes"));
        }
        Ok(Self {
            ptr: ptr as usize,
            len: size,
        })
    }

    /// Reserve `size` bytes of address space with no access permissions,
    /// preferably at `hint`. `size` must be a multiple of the page size.
    /// The hint is best-effort; the OS picks another address if the
    /// requested one is unavailable.
    #[cfg(windows)]
    pub fn reserve(size: usize, hint: Option<usize>) -> Result<Self> {
        use std::io;
        use std::ptr;
        use winapi::um::memoryapi::VirtualAlloc;
        use winapi::um::winnt::{MEM_RESERVE, PAGE_NOACCESS};

        assert!(size > 0);
        assert_eq!(size & (page_size() - 1), 0);

        let mut ptr = unsafe {
            VirtualAlloc(
                hint.unwrap_or(0) as *mut _,
                size,
                MEM_RESERVE,
                PAGE_NOACCESS,
            )
        };
        if ptr.is_null() && hint.is_some() {
            ptr = unsafe { VirtualAlloc(ptr::null_mut(), size, MEM_RESERVE, PAGE_NOACCESS) };
        }
        if ptr.is_null() {
            return Err(io::Error::last_os_error())
                .context(format!("VirtualAlloc failed to reserve {size:#x} bytes"));
        }
        Ok(Self {
            ptr: ptr as usize,
            len: size,
        })
    }

    pub fn address(&self) -> usize {
        self.ptr
    }

    pub fn end(&self) -> usize {
        self.ptr + self.len
    }

    pub fn size(&self) -> usize {
        self.len
    }
}

impl Drop for VirtualMemory {
    #[cfg(unix)]
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) };
        assert_eq!(rc, 0, "munmap failed");
    }

    #[cfg(windows)]
    fn drop(&mut self) {
        use winapi::um::memoryapi::VirtualFree;
        use winapi::um::winnt::MEM_RELEASE;
        let rc = unsafe { VirtualFree(self.ptr as *mut _, 0, MEM_RELEASE) };
        assert_ne!(rc, 0, "VirtualFree failed");
    }
}

/// The OS allocation granularity for code pages.
pub fn page_size() -> usize {
    region::page::size()
}

pub(crate) fn round_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

pub(crate) fn round_up_to_page(value: usize) -> usize {
    round_up(value, page_size())
}

/// Back the given page-aligned range of a reservation with accessible
/// memory carrying `perm`.
#[cfg(unix)]
pub(crate) fn commit_pages(start: usize, len: usize, perm: Permission) -> Result<()> {
    // On unix the pages were already reserved by the anonymous mapping;
    // committing is just a protection change away from PROT_NONE.
    set_permissions(start, len, perm)
}

/// Back the given page-aligned range of a reservation with accessible
/// memory carrying `perm`.
#[cfg(windows)]
pub(crate) fn commit_pages(start: usize, len: usize, perm: Permission) -> Result<()> {
    use std::io;
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_COMMIT, PAGE_EXECUTE_READWRITE, PAGE_READWRITE};

    let protect = match perm {
        Permission::ReadWrite => PAGE_READWRITE,
        Permission::ReadWriteExecute => PAGE_EXECUTE_READWRITE,
        Permission::ReadExecute => unreachable!("code pages are committed writable"),
    };
    let ptr = unsafe { VirtualAlloc(start as *mut _, len, MEM_COMMIT, protect) };
    if ptr.is_null() {
        return Err(io::Error::last_os_error())
            .context(format!("VirtualAlloc failed to commit {len:#x} bytes"));
    }
    Ok(())
}

/// Change the protection of already-committed pages.
pub(crate) fn set_permissions(start: usize, len: usize, perm: Permission) -> Result<()> {
    debug_assert_eq!(start & (page_size() - 1), 0);
    unsafe {
        region::protect(start as *const u8, len, perm.as_region()).with_context(|| {
            format!(
                "failed to set {perm:?} on {:#x}..{:#x}",
                start,
                start + len
            )
        })
    }
}

/// Flush the instruction cache for a range of code that was just written
/// or patched, so no core keeps executing stale bytes.
pub(crate) fn flush_icache(start: usize, len: usize) {
    if len == 0 {
        return;
    }
    let ptr = start as *const std::ffi::c_void;
    let result = unsafe { wasmtime_jit_icache_coherence::clear_cache(ptr, len) }
        .and_then(|()| wasmtime_jit_icache_coherence::pipeline_flush_mt());
    if let Err(e) = result {
        panic!("failed to flush instruction cache: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_commit_write_roundtrip() {
        let page = page_size();
        let mem = VirtualMemory::reserve(4 * page, None).unwrap();
        assert_eq!(mem.size(), 4 * page);
        assert_eq!(mem.end() - mem.address(), 4 * page);

        commit_pages(mem.address(), 2 * page, Permission::ReadWrite).unwrap();
        unsafe {
            let slice = std::slice::from_raw_parts_mut(mem.address() as *mut u8, 2 * page);
            slice[0] = 0xAA;
            slice[2 * page - 1] = 0xBB;
            assert_eq!(slice[0], 0xAA);
            assert_eq!(slice[2 * page - 1], 0xBB);
        }
    }

    #[test]
    fn reserve_honors_page_rounding_helpers() {
        let page = page_size();
        assert_eq!(round_up_to_page(1), page);
        assert_eq!(round_up_to_page(page), page);
        assert_eq!(round_up_to_page(page + 1), 2 * page);
        assert_eq!(round_up(5, 16), 16);
        assert_eq!(round_up(16, 16), 16);
    }

    #[test]
    fn committed_pages_can_become_executable() {
        let page = page_size();
        let mem = VirtualMemory::reserve(page, None).unwrap();
        commit_pages(mem.address(), page, Permission::ReadWrite).unwrap();
        set_permissions(mem.address(), page, Permission::ReadExecute).unwrap();
        set_permissions(mem.address(), page, Permission::ReadWrite).unwrap();
    }
}
