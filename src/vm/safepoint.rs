//! Stop-the-world synchronization.
//!
//! The collecting thread owns the heap lock, takes the thread registry and
//! the root registry, then raises `gc_running` and waits until every other
//! attached thread has left the `RUNNING` state. Mutators notice the flag at
//! their next safepoint poll, or when they leave a safe region, and park on
//! the safepoint monitor until the collector lowers the flag again.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::yield_now,
};

use super::{
    thread::{Thread, GC_STATE_RUNNING},
    VirtualMachine,
};
use crate::{
    gc::{conservative::with_spilled_registers, Heap, HeapStats},
    runtime::error::Result,
    sync::Monitor,
};

pub struct Safepoint {
    gc_running: AtomicBool,
    monitor: Monitor<()>,
}

impl Safepoint {
    pub(crate) fn new() -> Result<Self> {
        Ok(Self {
            gc_running: AtomicBool::new(false),
            monitor: Monitor::new(())?,
        })
    }

    /// Cheap poll used on the allocation path.
    #[inline]
    pub fn is_requested(&self) -> bool {
        self.gc_running.load(Ordering::Relaxed)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.gc_running.load(Ordering::SeqCst)
    }

    pub(crate) fn wait_for_collection(&self) {
        let mut locker = self.monitor.lock(false);
        while self.gc_running.load(Ordering::SeqCst) {
            locker.wait();
        }
    }

    /// Raises the flag and waits for every thread except `current` to stop.
    fn begin(&self, threads: &[Arc<Thread>], current: Option<usize>) {
        self.gc_running.store(true, Ordering::SeqCst);
        for thread in threads.iter() {
            if Some(thread.id()) == current {
                continue;
            }
            let mut spins = 0u32;
            while thread.gc_state_seq_cst() == GC_STATE_RUNNING {
                if spins < 64 {
                    std::hint::spin_loop();
                } else {
                    yield_now();
                }
                spins = spins.saturating_add(1);
            }
        }
        log::trace!(target: "safepoint", "{} threads stopped", threads.len());
    }

    fn end(&self) {
        let locker = self.monitor.lock(false);
        self.gc_running.store(false, Ordering::SeqCst);
        locker.notify_all();
    }
}

impl VirtualMachine {
    /// The attached thread of the caller, when it belongs to this machine.
    fn current_mutator(&self) -> Option<Arc<Thread>> {
        Thread::current().filter(|thread| std::ptr::eq(Arc::as_ptr(thread.vm()), self))
    }

    /// Runs a stop-the-world collection. The caller holds the heap lock.
    #[inline(never)]
    pub(crate) fn collect_locked(&self, heap: &mut Heap) -> HeapStats {
        let current = self.current_mutator();

        with_spilled_registers(|sp| {
            if let Some(thread) = &current {
                thread.record_stack_pointer(sp);
            }

            let threads = self.threads.lock(false);
            let roots = self.roots.lock(false);
            self.safepoint
                .begin(&threads, current.as_ref().map(|thread| thread.id()));

            // Every mutator is stopped: nobody changes the symbol table.
            let symbols = unsafe { self.symbols.unsafe_get() };
            let scan_stacks = self.options.conservative_stack_scan;

            let stats = heap.collect(|marker| {
                for location in roots.locations() {
                    unsafe { marker.mark_slot(location) };
                }
                for region in roots.regions() {
                    unsafe { marker.scan_region(*region, &roots.exclusions) };
                }
                for thread in threads.iter() {
                    if scan_stacks {
                        if let Some(stack) = thread.scannable_stack() {
                            unsafe { marker.scan_region(stack, &roots.exclusions) };
                        }
                    }
                    unsafe { thread.control_unchecked().trace(marker) };
                }
                symbols.trace(marker);
            });

            self.safepoint.end();
            drop(roots);
            drop(threads);
            stats
        })
    }
}
