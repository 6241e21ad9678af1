//! Page-granular memory straight from the OS. Heap blocks and large objects
//! are carved out of these mappings; memory obtained here is zero-filled.

use once_cell::sync::Lazy;

use super::memory_region::MemoryRegion;
use crate::utils::{is_power_of_two, round_up};

static PAGE_SIZE: Lazy<usize> = Lazy::new(os::page_size);

pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// One OS mapping, released when dropped.
pub struct VirtualMemory {
    region: MemoryRegion,
    /// What has to be handed back to the OS. Larger than `region` on
    /// platforms that cannot trim an over-sized reservation.
    reserved: MemoryRegion,
}

unsafe impl Send for VirtualMemory {}
unsafe impl Sync for VirtualMemory {}

impl VirtualMemory {
    /// Maps `size` bytes, rounded up to whole pages.
    pub fn allocate(size: usize, name: &str) -> Option<Self> {
        Self::allocate_aligned(size, page_size(), name)
    }

    /// Maps `size` bytes starting at a multiple of `alignment`, which must be
    /// a power of two. `None` when the OS refuses.
    pub fn allocate_aligned(size: usize, alignment: usize, name: &str) -> Option<Self> {
        debug_assert!(is_power_of_two(alignment));
        let size = round_up(size, page_size(), 0);
        let alignment = alignment.max(page_size());
        let (region, reserved) = unsafe { os::map_aligned(size, alignment)? };
        log::trace!(target: "gc", "mapped {:?} for {}", region, name);
        Some(Self { region, reserved })
    }

    pub fn region(&self) -> &MemoryRegion {
        &self.region
    }

    pub fn start(&self) -> usize {
        self.region.start()
    }

    pub fn address(&self) -> *mut u8 {
        self.region.pointer()
    }

    pub fn size(&self) -> usize {
        self.region.size()
    }
}

impl Drop for VirtualMemory {
    fn drop(&mut self) {
        unsafe { os::release(self.reserved) };
    }
}

#[cfg(unix)]
mod os {
    use std::ptr::null_mut;

    use crate::{gc::memory_region::MemoryRegion, utils::round_up};

    pub fn page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    unsafe fn unmap(start: usize, end: usize) {
        if end > start && libc::munmap(start as *mut libc::c_void, end - start) != 0 {
            log::warn!(target: "gc", "munmap {:#x}..{:#x}: {}", start, end, errno::errno());
        }
    }

    /// Over-maps by `alignment - page` bytes and unmaps the slack on both
    /// sides of the aligned range.
    pub unsafe fn map_aligned(size: usize, alignment: usize) -> Option<(MemoryRegion, MemoryRegion)> {
        let mapped_size = size + alignment - page_size();
        let base = libc::mmap(
            null_mut(),
            mapped_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if base == libc::MAP_FAILED {
            log::warn!(target: "gc", "mmap of {} bytes: {}", mapped_size, errno::errno());
            return None;
        }

        let base = base as usize;
        let start = round_up(base, alignment, 0);
        unmap(base, start);
        unmap(start + size, base + mapped_size);

        let region = MemoryRegion::from_range(start, start + size);
        Some((region, region))
    }

    pub unsafe fn release(reserved: MemoryRegion) {
        unmap(reserved.start(), reserved.end());
    }
}

#[cfg(windows)]
mod os {
    use std::{mem::MaybeUninit, ptr::null_mut};

    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree},
        sysinfoapi::{GetSystemInfo, SYSTEM_INFO},
        winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE},
    };

    use crate::{gc::memory_region::MemoryRegion, utils::round_up};

    pub fn page_size() -> usize {
        let mut info = MaybeUninit::<SYSTEM_INFO>::zeroed();
        unsafe {
            GetSystemInfo(info.as_mut_ptr());
            info.assume_init().dwPageSize as usize
        }
    }

    /// Reserves an over-sized range and commits only its aligned part.
    /// Reservations cannot be trimmed, so the whole one is kept.
    pub unsafe fn map_aligned(size: usize, alignment: usize) -> Option<(MemoryRegion, MemoryRegion)> {
        let reserved_size = size + alignment - page_size();
        let base = VirtualAlloc(null_mut(), reserved_size, MEM_RESERVE, PAGE_READWRITE);
        if base.is_null() {
            log::warn!(target: "gc", "reserving {} bytes failed", reserved_size);
            return None;
        }

        let start = round_up(base as usize, alignment, 0);
        if VirtualAlloc(start as _, size, MEM_COMMIT, PAGE_READWRITE) as usize != start {
            log::warn!(target: "gc", "committing {} bytes at {:#x} failed", size, start);
            VirtualFree(base, 0, MEM_RELEASE);
            return None;
        }

        let reserved = MemoryRegion::from_range(base as usize, base as usize + reserved_size);
        Some((MemoryRegion::from_range(start, start + size), reserved))
    }

    pub unsafe fn release(reserved: MemoryRegion) {
        VirtualFree(reserved.pointer().cast(), 0, MEM_RELEASE);
    }
}
