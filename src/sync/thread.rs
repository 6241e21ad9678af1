//! Threads on top of a [`ThreadSystem`], with `std`-like join semantics.

use std::{
    cell::UnsafeCell,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use super::{Platform, ThreadSystem};
use crate::{
    runtime::error::{fatal, FatalKind, Result},
    vm::thread::safe_region_if_attached,
};

struct Packet<T> {
    result: UnsafeCell<Option<std::thread::Result<T>>>,
}

// Written once by the spawned thread, read once after join.
unsafe impl<T: Send> Sync for Packet<T> {}

/// An owned permission to join on a thread. Dropping it detaches the thread.
pub struct JoinHandle<T, P: ThreadSystem = Platform> {
    native: Option<P::Handle>,
    packet: Arc<Packet<T>>,
}

impl<T, P: ThreadSystem> JoinHandle<T, P> {
    /// Waits for the thread to finish. A panic of the thread, including a
    /// fatal runtime error, is returned as `Err` with its payload.
    pub fn join(mut self) -> std::thread::Result<T> {
        if let Some(native) = self.native.take() {
            if let Err(err) = safe_region_if_attached(|| P::join(native)) {
                fatal(FatalKind::Internal, err.to_string());
            }
        }

        let packet = match Arc::get_mut(&mut self.packet) {
            Some(packet) => packet,
            None => fatal(FatalKind::Internal, "joined thread still owns its result"),
        };
        match packet.result.get_mut().take() {
            Some(result) => result,
            None => fatal(FatalKind::Internal, "joined thread left no result"),
        }
    }
}

impl<T, P: ThreadSystem> Drop for JoinHandle<T, P> {
    fn drop(&mut self) {
        if let Some(native) = self.native.take() {
            P::detach(native);
        }
    }
}

/// Spawns a thread on the native backend with the default stack size.
pub fn spawn<F, T>(f: F) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    spawn_with::<Platform, F, T>(None, f)
}

pub fn spawn_with<P, F, T>(stack_size: Option<usize>, f: F) -> Result<JoinHandle<T, P>>
where
    P: ThreadSystem,
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let packet = Arc::new(Packet {
        result: UnsafeCell::new(None),
    });
    let their_packet = packet.clone();

    let main = move || {
        let result = catch_unwind(AssertUnwindSafe(f));
        unsafe {
            *their_packet.result.get() = Some(result);
        }
        drop(their_packet);
    };

    let native = P::spawn(stack_size, Box::new(main))?;
    log::trace!(target: "sync", "spawned {} thread", P::NAME);
    Ok(JoinHandle {
        native: Some(native),
        packet,
    })
}
