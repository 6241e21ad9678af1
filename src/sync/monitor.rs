use std::{
    ops::{Deref, DerefMut},
    time::{Duration, Instant},
};

use super::{
    mutex::{Condvar, Mutex, MutexGuard, WaitTimeoutResult},
    Platform, ThreadSystem,
};
use crate::runtime::error::Result;

/// A mutex paired with the condition variable that signals changes to the
/// data it protects.
pub struct Monitor<T, P: ThreadSystem = Platform> {
    mutex: Mutex<T, P>,
    cv: Condvar<P>,
}

unsafe impl<T: Send, P: ThreadSystem> Send for Monitor<T, P> {}
unsafe impl<T: Send, P: ThreadSystem> Sync for Monitor<T, P> {}

impl<T, P: ThreadSystem> Monitor<T, P> {
    pub fn new(val: T) -> Result<Self> {
        Ok(Self {
            mutex: Mutex::new(val)?,
            cv: Condvar::new()?,
        })
    }

    pub fn lock(&self, safepoint: bool) -> MonitorLocker<'_, T, P> {
        MonitorLocker {
            guard: self.mutex.lock(safepoint),
            cv: &self.cv,
        }
    }

    pub fn try_lock(&self, safepoint: bool) -> Option<MonitorLocker<'_, T, P>> {
        self.mutex.try_lock(safepoint).map(|guard| MonitorLocker {
            guard,
            cv: &self.cv,
        })
    }

    pub fn notify_all(&self) {
        self.cv.notify_all()
    }

    pub fn notify_one(&self) {
        self.cv.notify_one()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.mutex.get_mut()
    }

    /// # Safety
    ///
    /// See [`Mutex::unsafe_get`].
    pub unsafe fn unsafe_get(&self) -> &T {
        self.mutex.unsafe_get()
    }

    pub fn mutex(&self) -> &Mutex<T, P> {
        &self.mutex
    }
}

/// Holds the monitor's lock. Waiters are woken when it is dropped.
pub struct MonitorLocker<'a, T, P: ThreadSystem = Platform> {
    cv: &'a Condvar<P>,
    guard: MutexGuard<'a, T, P>,
}

impl<'a, T, P: ThreadSystem> MonitorLocker<'a, T, P> {
    pub fn wait(&mut self) {
        self.cv.wait(&mut self.guard);
    }

    pub fn wait_until(&mut self, deadline: Instant) -> WaitTimeoutResult {
        self.cv.wait_until(&mut self.guard, deadline)
    }

    pub fn wait_for(&mut self, timeout: Duration) -> WaitTimeoutResult {
        self.cv.wait_for(&mut self.guard, timeout)
    }

    pub fn wait_while(&mut self, condition: impl FnMut(&mut T) -> bool) {
        self.cv.wait_while(&mut self.guard, condition)
    }

    pub fn notify(&self) {
        self.cv.notify_one();
    }

    pub fn notify_all(&self) {
        self.cv.notify_all();
    }
}

impl<'a, T, P: ThreadSystem> Deref for MonitorLocker<'a, T, P> {
    type Target = MutexGuard<'a, T, P>;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<'a, T, P: ThreadSystem> DerefMut for MonitorLocker<'a, T, P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl<'a, T, P: ThreadSystem> Drop for MonitorLocker<'a, T, P> {
    fn drop(&mut self) {
        self.cv.notify_all();
    }
}
