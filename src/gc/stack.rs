//! Native stack extents of the calling thread.

use super::memory_region::MemoryRegion;

/// Native stack of a thread. Stacks grow down, so live frames sit in
/// `(bound, origin]`. All zero when the platform would not tell.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct StackBounds {
    pub origin: usize,
    pub bound: usize,
}

impl StackBounds {
    pub fn current() -> Self {
        match unsafe { platform::current_stack() } {
            Some((bound, origin)) => Self { origin, bound },
            None => {
                log::warn!(target: "gc", "stack bounds unavailable, this stack is not scanned");
                Self::default()
            }
        }
    }

    pub fn is_none(&self) -> bool {
        self.origin == 0
    }

    pub fn contains(&self, address: usize) -> bool {
        address > self.bound && address <= self.origin
    }

    pub fn size(&self) -> usize {
        self.origin - self.bound
    }

    /// Everything from `sp` up to the origin: the frames live at `sp`.
    pub fn live_region(&self, sp: usize) -> Option<MemoryRegion> {
        if self.is_none() || !self.contains(sp) {
            return None;
        }
        Some(MemoryRegion::from_range(sp, self.origin))
    }
}

#[cfg(target_vendor = "apple")]
mod platform {
    pub unsafe fn current_stack() -> Option<(usize, usize)> {
        let thread = libc::pthread_self();
        let origin = libc::pthread_get_stackaddr_np(thread) as usize;
        let size = libc::pthread_get_stacksize_np(thread);
        Some((origin - size, origin))
    }
}

#[cfg(target_os = "openbsd")]
mod platform {
    pub unsafe fn current_stack() -> Option<(usize, usize)> {
        let mut stack = std::mem::MaybeUninit::<libc::stack_t>::zeroed();
        if libc::pthread_stackseg_np(libc::pthread_self(), stack.as_mut_ptr()) != 0 {
            return None;
        }
        let stack = stack.assume_init();
        let origin = stack.ss_sp as usize;
        Some((origin - stack.ss_size, origin))
    }
}

#[cfg(all(unix, not(target_vendor = "apple"), not(target_os = "openbsd")))]
mod platform {
    use std::{mem::MaybeUninit, ptr::null_mut};

    pub unsafe fn current_stack() -> Option<(usize, usize)> {
        let mut attr = MaybeUninit::<libc::pthread_attr_t>::zeroed();
        if libc::pthread_attr_init(attr.as_mut_ptr()) != 0 {
            return None;
        }
        #[cfg(any(target_os = "freebsd", target_os = "netbsd"))]
        let rc = libc::pthread_attr_get_np(libc::pthread_self(), attr.as_mut_ptr());
        #[cfg(not(any(target_os = "freebsd", target_os = "netbsd")))]
        let rc = libc::pthread_getattr_np(libc::pthread_self(), attr.as_mut_ptr());

        let mut base = null_mut();
        let mut size = 0;
        let rc = if rc == 0 {
            libc::pthread_attr_getstack(attr.as_ptr(), &mut base, &mut size)
        } else {
            rc
        };
        libc::pthread_attr_destroy(attr.as_mut_ptr());
        (rc == 0).then(|| (base as usize, base as usize + size))
    }
}

#[cfg(windows)]
mod platform {
    use winapi::um::processthreadsapi::GetCurrentThreadStackLimits;

    pub unsafe fn current_stack() -> Option<(usize, usize)> {
        let mut low = 0;
        let mut high = 0;
        GetCurrentThreadStackLimits(&mut low, &mut high);
        (high != 0).then_some((low, high))
    }
}

/// Address of a local in a fresh frame: at or below every live frame of the caller.
#[inline(never)]
pub fn approximate_stack_pointer() -> usize {
    let marker = 0usize;
    std::hint::black_box(&marker) as *const usize as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_stack_contains_locals() {
        let bounds = StackBounds::current();
        assert!(!bounds.is_none());
        let local = 0u8;
        assert!(bounds.contains(&local as *const u8 as usize));

        let sp = approximate_stack_pointer();
        let live = bounds.live_region(sp).unwrap();
        assert_eq!(live.end(), bounds.origin);
        assert!(live.size() < bounds.size());
        assert!(bounds.live_region(bounds.origin + 1).is_none());
    }
}
