//! User-space backend on top of `parking_lot_core`.
//!
//! The mutex is a one-byte futex-style lock and the condition variable a
//! sequence counter that waiters park on. Threads are plain
//! `std` threads.

use std::{
    sync::atomic::{AtomicU32, AtomicU8, Ordering},
    time::{Duration, Instant},
};

use parking_lot_core::{ParkResult, SpinWait, DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};

use super::{RawCondvar, RawMutex, ThreadSystem};
use crate::runtime::error::{Error, Result};

const UNLOCKED: u8 = 0;
const LOCKED: u8 = 1;
/// Locked, and some thread may be parked on the lock.
const CONTENDED: u8 = 2;

pub struct Parking;

/// Three-state lock. Unlocking a `CONTENDED` lock wakes one parked thread,
/// which then takes the lock as `CONTENDED` again since it cannot know
/// whether others are still parked.
pub struct ParkingMutex {
    state: AtomicU8,
}

impl ParkingMutex {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNLOCKED),
        }
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != UNLOCKED
    }

    fn key(&self) -> usize {
        self as *const Self as usize
    }

    #[cold]
    fn lock_contended(&self) {
        let mut spin = SpinWait::new();
        while self.state.load(Ordering::Relaxed) == LOCKED && spin.spin() {}

        while self.state.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            // Only sleep if the lock is still held when the queue is locked.
            unsafe {
                parking_lot_core::park(
                    self.key(),
                    || self.state.load(Ordering::Relaxed) == CONTENDED,
                    || {},
                    |_, _| {},
                    DEFAULT_PARK_TOKEN,
                    None,
                );
            }
        }
    }
}

impl Default for ParkingMutex {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl RawMutex for ParkingMutex {
    fn create() -> Result<Self> {
        Ok(Self::new())
    }

    #[inline]
    fn lock(&self) {
        if !self.try_lock() {
            self.lock_contended();
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    unsafe fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            parking_lot_core::unpark_one(self.key(), |_| DEFAULT_UNPARK_TOKEN);
        }
    }
}

/// Waiters park on the address of the counter after reading it; every
/// signal bumps it, so a wakeup between unlocking and parking is not lost.
pub struct ParkingCondvar {
    sequence: AtomicU32,
}

impl ParkingCondvar {
    pub const fn new() -> Self {
        Self {
            sequence: AtomicU32::new(0),
        }
    }

    unsafe fn park(&self, mutex: &ParkingMutex, deadline: Option<Instant>) -> bool {
        let sequence = self.sequence.load(Ordering::Relaxed);
        mutex.unlock();

        let addr = self as *const _ as usize;
        let validate = || self.sequence.load(Ordering::Relaxed) == sequence;
        let result = parking_lot_core::park(
            addr,
            validate,
            || {},
            |_, _| {},
            DEFAULT_PARK_TOKEN,
            deadline,
        );

        mutex.lock();
        matches!(result, ParkResult::TimedOut)
    }
}

impl Default for ParkingCondvar {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl RawCondvar for ParkingCondvar {
    type Mutex = ParkingMutex;

    fn create() -> Result<Self> {
        Ok(Self::new())
    }

    unsafe fn wait(&self, mutex: &ParkingMutex) {
        self.park(mutex, None);
    }

    unsafe fn wait_timeout(&self, mutex: &ParkingMutex, timeout: Duration) -> bool {
        self.park(mutex, Instant::now().checked_add(timeout))
    }

    fn signal(&self) {
        self.sequence.fetch_add(1, Ordering::Relaxed);
        unsafe {
            parking_lot_core::unpark_one(self as *const _ as usize, |_| DEFAULT_UNPARK_TOKEN);
        }
    }

    fn broadcast(&self) {
        self.sequence.fetch_add(1, Ordering::Relaxed);
        unsafe {
            parking_lot_core::unpark_all(self as *const _ as usize, DEFAULT_UNPARK_TOKEN);
        }
    }
}

impl ThreadSystem for Parking {
    type Mutex = ParkingMutex;
    type Condvar = ParkingCondvar;
    type Handle = std::thread::JoinHandle<()>;

    const NAME: &'static str = "parking";

    fn spawn(stack_size: Option<usize>, main: Box<dyn FnOnce() + Send>) -> Result<Self::Handle> {
        let mut builder = std::thread::Builder::new();
        if let Some(size) = stack_size {
            builder = builder.stack_size(size);
        }
        builder.spawn(main).map_err(Error::ThreadSpawn)
    }

    fn join(handle: Self::Handle) -> Result<()> {
        // The spawned closure catches its own panic into the packet, so an
        // error here carries nothing the joiner has not already seen.
        handle.join().ok();
        Ok(())
    }

    fn detach(handle: Self::Handle) {
        drop(handle);
    }
}
