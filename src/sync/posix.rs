//! pthread backend.

use std::{cell::UnsafeCell, mem::MaybeUninit, ptr::null_mut, time::Duration};

use super::{RawCondvar, RawMutex, ThreadSystem};
use crate::runtime::error::{Error, Result};

pub struct Posix;

/// A `pthread_mutex_t`, boxed because it must not move once initialized.
pub struct PosixMutex {
    inner: Box<UnsafeCell<libc::pthread_mutex_t>>,
}

unsafe impl Send for PosixMutex {}
unsafe impl Sync for PosixMutex {}

unsafe impl RawMutex for PosixMutex {
    fn create() -> Result<Self> {
        let inner = Box::new(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER));
        unsafe {
            let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
            let rc = libc::pthread_mutexattr_init(attr.as_mut_ptr());
            if rc != 0 {
                return Err(Error::creation("mutex", rc));
            }
            libc::pthread_mutexattr_settype(attr.as_mut_ptr(), libc::PTHREAD_MUTEX_NORMAL);
            let rc = libc::pthread_mutex_init(inner.get(), attr.as_ptr());
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            if rc != 0 {
                return Err(Error::creation("mutex", rc));
            }
        }
        Ok(Self { inner })
    }

    fn lock(&self) {
        let rc = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
        debug_assert_eq!(rc, 0, "pthread_mutex_lock: {}", errno::Errno(rc));
    }

    fn try_lock(&self) -> bool {
        unsafe { libc::pthread_mutex_trylock(self.inner.get()) == 0 }
    }

    unsafe fn unlock(&self) {
        let rc = libc::pthread_mutex_unlock(self.inner.get());
        debug_assert_eq!(rc, 0, "pthread_mutex_unlock: {}", errno::Errno(rc));
    }
}

impl Drop for PosixMutex {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_destroy(self.inner.get());
        }
    }
}

pub struct PosixCondvar {
    inner: Box<UnsafeCell<libc::pthread_cond_t>>,
}

unsafe impl Send for PosixCondvar {}
unsafe impl Sync for PosixCondvar {}

// Timed waits are measured against CLOCK_MONOTONIC where the condition
// variable can be told so; Apple platforms only offer the realtime clock.
#[cfg(not(target_vendor = "apple"))]
const WAIT_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;
#[cfg(target_vendor = "apple")]
const WAIT_CLOCK: libc::clockid_t = libc::CLOCK_REALTIME;

fn deadline(timeout: Duration) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(WAIT_CLOCK, &mut now);
    }
    let nanos = now.tv_nsec as u64 + timeout.subsec_nanos() as u64;
    let secs = (now.tv_sec as u64)
        .saturating_add(timeout.as_secs())
        .saturating_add(nanos / 1_000_000_000);
    libc::timespec {
        tv_sec: secs.min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: (nanos % 1_000_000_000) as _,
    }
}

unsafe impl RawCondvar for PosixCondvar {
    type Mutex = PosixMutex;

    fn create() -> Result<Self> {
        let inner = Box::new(UnsafeCell::new(libc::PTHREAD_COND_INITIALIZER));
        unsafe {
            let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
            let rc = libc::pthread_condattr_init(attr.as_mut_ptr());
            if rc != 0 {
                return Err(Error::creation("condition variable", rc));
            }
            #[cfg(not(target_vendor = "apple"))]
            libc::pthread_condattr_setclock(attr.as_mut_ptr(), WAIT_CLOCK);
            let rc = libc::pthread_cond_init(inner.get(), attr.as_ptr());
            libc::pthread_condattr_destroy(attr.as_mut_ptr());
            if rc != 0 {
                return Err(Error::creation("condition variable", rc));
            }
        }
        Ok(Self { inner })
    }

    unsafe fn wait(&self, mutex: &PosixMutex) {
        let rc = libc::pthread_cond_wait(self.inner.get(), mutex.inner.get());
        debug_assert_eq!(rc, 0);
    }

    unsafe fn wait_timeout(&self, mutex: &PosixMutex, timeout: Duration) -> bool {
        let deadline = deadline(timeout);
        let rc = libc::pthread_cond_timedwait(self.inner.get(), mutex.inner.get(), &deadline);
        debug_assert!(rc == 0 || rc == libc::ETIMEDOUT);
        rc == libc::ETIMEDOUT
    }

    fn signal(&self) {
        unsafe {
            libc::pthread_cond_signal(self.inner.get());
        }
    }

    fn broadcast(&self) {
        unsafe {
            libc::pthread_cond_broadcast(self.inner.get());
        }
    }
}

impl Drop for PosixCondvar {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_cond_destroy(self.inner.get());
        }
    }
}

pub struct PosixThread {
    native: libc::pthread_t,
}

unsafe impl Send for PosixThread {}

extern "C" fn thread_start(main: *mut libc::c_void) -> *mut libc::c_void {
    unsafe {
        let main = Box::from_raw(main as *mut Box<dyn FnOnce() + Send>);
        main();
    }
    null_mut()
}

impl ThreadSystem for Posix {
    type Mutex = PosixMutex;
    type Condvar = PosixCondvar;
    type Handle = PosixThread;

    const NAME: &'static str = "posix";

    fn spawn(stack_size: Option<usize>, main: Box<dyn FnOnce() + Send>) -> Result<PosixThread> {
        let main = Box::into_raw(Box::new(main));
        unsafe {
            let mut attr = MaybeUninit::<libc::pthread_attr_t>::uninit();
            let rc = libc::pthread_attr_init(attr.as_mut_ptr());
            if rc != 0 {
                drop(Box::from_raw(main));
                return Err(Error::ThreadSpawn(std::io::Error::from_raw_os_error(rc)));
            }
            if let Some(size) = stack_size {
                let size = size.max(libc::PTHREAD_STACK_MIN);
                libc::pthread_attr_setstacksize(attr.as_mut_ptr(), size);
            }

            let mut native: libc::pthread_t = std::mem::zeroed();
            let rc = libc::pthread_create(&mut native, attr.as_ptr(), thread_start, main.cast());
            libc::pthread_attr_destroy(attr.as_mut_ptr());

            if rc != 0 {
                drop(Box::from_raw(main));
                return Err(Error::ThreadSpawn(std::io::Error::from_raw_os_error(rc)));
            }
            Ok(PosixThread { native })
        }
    }

    fn join(handle: PosixThread) -> Result<()> {
        let rc = unsafe { libc::pthread_join(handle.native, null_mut()) };
        if rc != 0 {
            return Err(Error::ThreadJoin(std::io::Error::from_raw_os_error(rc)));
        }
        Ok(())
    }

    fn detach(handle: PosixThread) {
        unsafe {
            libc::pthread_detach(handle.native);
        }
    }
}
