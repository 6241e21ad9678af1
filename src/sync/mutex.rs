//! Typed mutex and condition variable over a [`ThreadSystem`].
//!
//! `lock(safepoint)` decides how the calling mutator blocks: with
//! `safepoint = true` a contended lock is waited for inside a safe region, so
//! a stop-the-world collection can proceed meanwhile. Locks taken by the
//! collector itself, or while the caller must not be stopped, pass `false`.

use std::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    time::{Duration, Instant},
};

use super::{Platform, RawCondvar, RawMutex, ThreadSystem};
use crate::{runtime::error::Result, vm::thread::safe_region_if_attached};

/// Outcome of a timed condition variable wait.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct WaitTimeoutResult(bool);

impl WaitTimeoutResult {
    /// `true` if the wait ended because its time ran out.
    #[inline]
    pub fn timed_out(self) -> bool {
        self.0
    }
}

pub struct Mutex<T: ?Sized, P: ThreadSystem = Platform> {
    raw: P::Mutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send, P: ThreadSystem> Send for Mutex<T, P> {}
unsafe impl<T: ?Sized + Send, P: ThreadSystem> Sync for Mutex<T, P> {}

impl<T, P: ThreadSystem> Mutex<T, P> {
    pub fn new(val: T) -> Result<Self> {
        Ok(Mutex {
            raw: P::Mutex::create()?,
            data: UnsafeCell::new(val),
        })
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized, P: ThreadSystem> Mutex<T, P> {
    /// # Safety
    ///
    /// No other thread may be mutating the data, e.g. because all of them
    /// are stopped at a safepoint.
    pub unsafe fn unsafe_get(&self) -> &T {
        &*self.data.get()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    #[inline]
    pub fn lock(&self, safepoint: bool) -> MutexGuard<'_, T, P> {
        if !self.raw.try_lock() {
            if safepoint {
                safe_region_if_attached(|| self.raw.lock());
            } else {
                self.raw.lock();
            }
        }
        MutexGuard {
            mutex: self,
            safepoint,
            marker: PhantomData,
        }
    }

    /// Attempts to acquire this lock without blocking.
    #[inline]
    pub fn try_lock(&self, safepoint: bool) -> Option<MutexGuard<'_, T, P>> {
        if self.raw.try_lock() {
            Some(MutexGuard {
                mutex: self,
                safepoint,
                marker: PhantomData,
            })
        } else {
            None
        }
    }
}

#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, T: ?Sized, P: ThreadSystem = Platform> {
    mutex: &'a Mutex<T, P>,
    safepoint: bool,
    // Guards must be released by the thread that locked.
    marker: PhantomData<*const ()>,
}

unsafe impl<'a, T: ?Sized + Sync, P: ThreadSystem> Sync for MutexGuard<'a, T, P> {}

impl<'a, T: ?Sized, P: ThreadSystem> MutexGuard<'a, T, P> {
    /// Runs `f` with the mutex released, relocking it afterwards.
    pub fn unlocked<F, U>(s: &mut Self, f: F) -> U
    where
        F: FnOnce() -> U,
    {
        unsafe { s.mutex.raw.unlock() };
        let r = f();
        if !s.mutex.raw.try_lock() {
            if s.safepoint {
                safe_region_if_attached(|| s.mutex.raw.lock());
            } else {
                s.mutex.raw.lock();
            }
        }
        r
    }

    pub fn mutex(s: &Self) -> &'a Mutex<T, P> {
        s.mutex
    }
}

impl<'a, T: ?Sized, P: ThreadSystem> Deref for MutexGuard<'a, T, P> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized, P: ThreadSystem> DerefMut for MutexGuard<'a, T, P> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized, P: ThreadSystem> Drop for MutexGuard<'a, T, P> {
    fn drop(&mut self) {
        unsafe { self.mutex.raw.unlock() }
    }
}

pub struct Condvar<P: ThreadSystem = Platform> {
    raw: P::Condvar,
}

impl<P: ThreadSystem> Condvar<P> {
    pub fn new() -> Result<Self> {
        Ok(Self {
            raw: P::Condvar::create()?,
        })
    }

    /// Blocks until notified. Spurious wakeups are possible.
    pub fn wait<T: ?Sized>(&self, guard: &mut MutexGuard<'_, T, P>) {
        let mutex = &guard.mutex.raw;
        if guard.safepoint {
            safe_region_if_attached(|| unsafe { self.raw.wait(mutex) });
        } else {
            unsafe { self.raw.wait(mutex) };
        }
    }

    pub fn wait_for<T: ?Sized>(
        &self,
        guard: &mut MutexGuard<'_, T, P>,
        timeout: Duration,
    ) -> WaitTimeoutResult {
        let mutex = &guard.mutex.raw;
        let timed_out = if guard.safepoint {
            safe_region_if_attached(|| unsafe { self.raw.wait_timeout(mutex, timeout) })
        } else {
            unsafe { self.raw.wait_timeout(mutex, timeout) }
        };
        WaitTimeoutResult(timed_out)
    }

    pub fn wait_until<T: ?Sized>(
        &self,
        guard: &mut MutexGuard<'_, T, P>,
        deadline: Instant,
    ) -> WaitTimeoutResult {
        let now = Instant::now();
        if now >= deadline {
            return WaitTimeoutResult(true);
        }
        self.wait_for(guard, deadline - now)
    }

    /// Waits as long as `condition` holds.
    pub fn wait_while<T: ?Sized>(
        &self,
        guard: &mut MutexGuard<'_, T, P>,
        mut condition: impl FnMut(&mut T) -> bool,
    ) {
        while condition(&mut **guard) {
            self.wait(guard);
        }
    }

    pub fn notify_one(&self) {
        self.raw.signal();
    }

    pub fn notify_all(&self) {
        self.raw.broadcast();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Parking;

    #[test]
    fn guard_gives_exclusive_access() {
        let mutex = Mutex::<_>::new(vec![1]).unwrap();
        {
            let mut guard = mutex.lock(false);
            guard.push(2);
            assert!(mutex.try_lock(false).is_none());
        }
        assert_eq!(*mutex.lock(false), vec![1, 2]);
    }

    #[test]
    fn unlocked_releases_temporarily() {
        let mutex = Mutex::<u32, Parking>::new(0).unwrap();
        let mut guard = mutex.lock(true);
        MutexGuard::unlocked(&mut guard, || {
            assert!(mutex.try_lock(false).is_some());
        });
        *guard += 1;
        drop(guard);
        assert_eq!(mutex.into_inner(), 1);
    }

    #[test]
    fn timed_wait_reports_timeout() {
        let mutex = Mutex::<(), Platform>::new(()).unwrap();
        let cv = Condvar::<Platform>::new().unwrap();
        let mut guard = mutex.lock(false);
        let start = Instant::now();
        assert!(cv.wait_for(&mut guard, Duration::from_millis(20)).timed_out());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }
}
