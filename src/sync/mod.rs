//! Portable mutexes, condition variables and threads.
//!
//! Each OS family provides one [`ThreadSystem`]: native pthreads on unix,
//! SRW locks and thread handles on Windows, and a user-space backend built on
//! `parking_lot_core` that works everywhere. [`Platform`] names the native
//! one. The rest of the crate only uses the typed wrappers in [`mutex`],
//! [`monitor`] and [`thread`].

use std::time::Duration;

use crate::runtime::error::Result;

pub mod monitor;
pub mod mutex;
pub mod parking;
#[cfg(unix)]
pub mod posix;
pub mod thread;
#[cfg(windows)]
pub mod windows;

/// A blocking, non-reentrant lock.
///
/// # Safety
///
/// Implementations must provide mutual exclusion between `lock`/`try_lock`
/// and `unlock`, with acquire/release ordering.
pub unsafe trait RawMutex: Send + Sync + Sized {
    fn create() -> Result<Self>;

    fn lock(&self);

    fn try_lock(&self) -> bool;

    /// # Safety
    ///
    /// The calling thread must hold the lock.
    unsafe fn unlock(&self);
}

/// # Safety
///
/// `wait` must atomically release the mutex and block, and re-acquire the
/// mutex before returning.
pub unsafe trait RawCondvar: Send + Sync + Sized {
    type Mutex: RawMutex;

    fn create() -> Result<Self>;

    /// # Safety
    ///
    /// The calling thread must hold `mutex`.
    unsafe fn wait(&self, mutex: &Self::Mutex);

    /// Returns `true` when the timeout elapsed.
    ///
    /// # Safety
    ///
    /// The calling thread must hold `mutex`.
    unsafe fn wait_timeout(&self, mutex: &Self::Mutex, timeout: Duration) -> bool;

    fn signal(&self);

    fn broadcast(&self);
}

/// One family of native primitives.
pub trait ThreadSystem: 'static + Sized {
    type Mutex: RawMutex;
    type Condvar: RawCondvar<Mutex = Self::Mutex>;
    type Handle: Send;

    const NAME: &'static str;

    fn spawn(stack_size: Option<usize>, main: Box<dyn FnOnce() + Send>) -> Result<Self::Handle>;

    /// Blocks until the thread behind `handle` has finished.
    fn join(handle: Self::Handle) -> Result<()>;

    /// Lets the thread run on without anyone joining it.
    fn detach(handle: Self::Handle);
}

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        pub type Platform = windows::Windows;
    } else {
        pub type Platform = posix::Posix;
    }
}

pub use monitor::{Monitor, MonitorLocker};
pub use mutex::{Condvar, Mutex, MutexGuard, WaitTimeoutResult};
pub use parking::Parking;
pub use thread::{spawn, JoinHandle};
