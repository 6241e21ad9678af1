//! Mutator threads: registration with a virtual machine, safepoints and
//! safe regions.
//!
//! An attached thread is always in one of three states. `RUNNING` threads
//! may touch the heap and must be waited for before a collection reads their
//! stacks. `WAITING` threads are parked at a safepoint and `SAFE` threads run
//! code that does not touch managed memory; for both the collector scans the
//! stack above the stack pointer they recorded on the way in.

use std::{
    cell::{RefCell, UnsafeCell},
    marker::PhantomData,
    ops::Deref,
    sync::{
        atomic::{AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
    thread::ThreadId,
};

use super::{control::ControlStack, options::VMOptions, VirtualMachine};
use crate::{
    gc::{
        conservative::with_spilled_registers,
        memory_region::MemoryRegion,
        stack::StackBounds,
    },
    runtime::{
        error::{contract_violation, fatal, Error, FatalKind, Result},
        value::{Kind, Value},
    },
    sync::{thread::spawn_with, JoinHandle, Platform},
    utils::round_up_to_word,
};

pub const GC_STATE_RUNNING: u8 = 0;
/// Parked at a safepoint until the running collection is over.
pub const GC_STATE_WAITING: u8 = 1;
/// Inside a safe region.
pub const GC_STATE_SAFE: u8 = 2;

thread_local! {
    static CURRENT: RefCell<Option<Arc<Thread>>> = const { RefCell::new(None) };
}

pub struct Thread {
    vm: Arc<VirtualMachine>,
    id: usize,
    owner: ThreadId,
    gc_state: AtomicU8,
    stack: StackBounds,
    last_sp: AtomicUsize,
    control: UnsafeCell<ControlStack>,
}

// The control stack is only touched by the owning thread, which `control`
// checks, or by a collector while the owner is stopped.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    fn new(vm: Arc<VirtualMachine>, id: usize) -> Self {
        let control = ControlStack::new(vm.options.frame_limit, vm.options.invocation_limit);
        Self {
            vm,
            id,
            owner: std::thread::current().id(),
            gc_state: AtomicU8::new(GC_STATE_RUNNING),
            stack: StackBounds::current(),
            last_sp: AtomicUsize::new(0),
            control: UnsafeCell::new(control),
        }
    }

    /// The thread attached on the calling OS thread, if any.
    pub fn current() -> Option<Arc<Thread>> {
        CURRENT.with(|current| current.borrow().clone())
    }

    pub fn vm(&self) -> &Arc<VirtualMachine> {
        &self.vm
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn gc_state(&self) -> u8 {
        self.gc_state.load(Ordering::Acquire)
    }

    pub(crate) fn gc_state_seq_cst(&self) -> u8 {
        self.gc_state.load(Ordering::SeqCst)
    }

    pub fn stack(&self) -> StackBounds {
        self.stack
    }

    /// `true` when called on the OS thread this thread was attached on.
    pub fn is_owner(&self) -> bool {
        std::thread::current().id() == self.owner
    }

    /// The control stack. Only its owner may reach it: frames, exits and
    /// bindings of one thread are never visible to another.
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn control(&self) -> &mut ControlStack {
        if !self.is_owner() {
            self.vm.fatal(
                FatalKind::ControlIntegrity,
                format!("control stack of thread {} used from another thread", self.id),
            );
        }
        unsafe { &mut *self.control.get() }
    }

    /// # Safety
    ///
    /// The owning thread must be stopped or be the caller.
    pub(crate) unsafe fn control_unchecked(&self) -> &ControlStack {
        &*self.control.get()
    }

    /// Part of the native stack a collector has to scan: everything from the
    /// last recorded stack pointer up to the stack origin.
    pub(crate) fn scannable_stack(&self) -> Option<MemoryRegion> {
        self.stack.live_region(self.last_sp.load(Ordering::Acquire))
    }

    pub(crate) fn record_stack_pointer(&self, sp: usize) {
        self.last_sp.store(sp, Ordering::Release);
    }

    /// Polls for a pending collection and parks until it is over.
    #[inline]
    pub fn safepoint(&self) {
        if self.vm.safepoint.is_requested() {
            self.enter_safepoint();
        }
    }

    #[cold]
    #[inline(never)]
    fn enter_safepoint(&self) {
        self.park();
        self.resume();
    }

    /// Records the stack pointer and waits out the running collection.
    #[inline(never)]
    fn park(&self) {
        with_spilled_registers(|sp| {
            self.record_stack_pointer(sp);
            self.gc_state.store(GC_STATE_WAITING, Ordering::SeqCst);
            log::trace!(target: "safepoint", "thread {} parked", self.id);
            self.vm.safepoint.wait_for_collection();
        });
    }

    /// Goes back to `RUNNING`, parking again if a collection started in
    /// the meantime.
    fn resume(&self) {
        loop {
            self.gc_state.store(GC_STATE_RUNNING, Ordering::SeqCst);
            if !self.vm.safepoint.is_running() {
                break;
            }
            self.park();
        }
        log::trace!(target: "safepoint", "thread {} running", self.id);
    }

    /// Runs `f` in a safe region: collections may run meanwhile, so `f` must
    /// not touch managed objects. Nested regions just run `f`.
    pub fn safe_region<R>(&self, f: impl FnOnce() -> R) -> R {
        if self.gc_state.load(Ordering::Relaxed) != GC_STATE_RUNNING {
            return f();
        }
        let _resume = ResumeOnExit(self);
        with_spilled_registers(|sp| {
            self.record_stack_pointer(sp);
            self.gc_state.store(GC_STATE_SAFE, Ordering::SeqCst);
            f()
        })
    }

    /// Allocates a zero-initialized object of `kind` with a `bytes` payload.
    ///
    /// May collect first. Running out of memory is fatal.
    pub fn allocate(&self, kind: Kind, bytes: usize) -> Value {
        self.allocate_words(kind, round_up_to_word(bytes))
    }

    pub(crate) fn allocate_words(&self, kind: Kind, words: usize) -> Value {
        if !kind.is_heap() {
            contract_violation(|| format!("allocation of a {}", kind.name()));
        }
        self.safepoint();

        let vm = &*self.vm;
        let (value, finalize) = {
            let mut heap = vm.heap.lock(true);
            if heap.should_collect(words) {
                vm.collect_locked(&mut heap);
            }
            let value = match heap.try_allocate(kind, words) {
                Some(value) => value,
                None => {
                    vm.collect_locked(&mut heap);
                    match heap.try_allocate(kind, words) {
                        Some(value) => value,
                        None => fatal(
                            FatalKind::HeapExhausted,
                            format!(
                                "cannot allocate a {} of {} words within a {} byte heap",
                                kind.name(),
                                words,
                                vm.options.gc_max_heap_size
                            ),
                        ),
                    }
                }
            };
            (value, heap.has_pending_finalizers())
        };

        if finalize {
            vm.run_finalizers();
        }
        value
    }
}

/// Leaves a safe region even when its body panics.
struct ResumeOnExit<'a>(&'a Thread);

impl Drop for ResumeOnExit<'_> {
    fn drop(&mut self) {
        self.0.resume();
    }
}

/// Applies `f` to the options of the machine the calling thread is attached
/// to. `None` for unattached threads, or while the attachment is changing.
pub(crate) fn current_options<R>(f: impl FnOnce(&VMOptions) -> R) -> Option<R> {
    CURRENT
        .try_with(|current| {
            let current = current.try_borrow().ok()?;
            current.as_ref().map(|thread| f(&thread.vm.options))
        })
        .ok()
        .flatten()
}

/// Runs `f` in a safe region of the calling thread, or just runs it when the
/// calling thread is not attached.
pub fn safe_region_if_attached<R>(f: impl FnOnce() -> R) -> R {
    match Thread::current() {
        Some(thread) => thread.safe_region(f),
        None => f(),
    }
}

/// Keeps the calling OS thread attached to a virtual machine. Dropping it
/// detaches the thread.
pub struct AttachedThread {
    thread: Arc<Thread>,
    marker: PhantomData<*const ()>,
}

impl AttachedThread {
    pub fn thread(&self) -> &Arc<Thread> {
        &self.thread
    }
}

impl Deref for AttachedThread {
    type Target = Thread;

    fn deref(&self) -> &Thread {
        &self.thread
    }
}

impl Drop for AttachedThread {
    fn drop(&mut self) {
        let vm = self.thread.vm.clone();
        {
            let mut threads = vm.threads.lock(true);
            threads.retain(|thread| !Arc::ptr_eq(thread, &self.thread));
        }
        CURRENT.with(|current| current.borrow_mut().take());
        log::debug!(target: "vm", "thread {} detached", self.thread.id);
    }
}

impl VirtualMachine {
    /// Registers the calling OS thread as a mutator of this machine.
    pub fn attach_current_thread(self: &Arc<Self>) -> Result<AttachedThread> {
        if CURRENT.with(|current| current.borrow().is_some()) {
            return Err(Error::AlreadyAttached);
        }

        let id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        let thread = Arc::new(Thread::new(self.clone(), id));
        {
            let mut threads = self.threads.lock(true);
            threads.push(thread.clone());
        }
        CURRENT.with(|current| *current.borrow_mut() = Some(thread.clone()));

        log::debug!(
            target: "vm",
            "thread {} attached, stack {:#x}..{:#x}",
            id,
            thread.stack.bound,
            thread.stack.origin
        );
        Ok(AttachedThread {
            thread,
            marker: PhantomData,
        })
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock(true).len()
    }
}

/// Spawns an OS thread attached to `vm` for as long as `f` runs.
pub fn spawn_thread<F, T>(vm: &Arc<VirtualMachine>, f: F) -> Result<JoinHandle<T>>
where
    F: FnOnce(&Thread) -> T + Send + 'static,
    T: Send + 'static,
{
    let vm = vm.clone();
    let stack_size = vm.options.thread_stack_size;
    spawn_with::<Platform, _, _>(stack_size, move || {
        let thread = match vm.attach_current_thread() {
            Ok(thread) => thread,
            Err(err) => fatal(FatalKind::Internal, err.to_string()),
        };
        f(&thread)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::error::{abort_on_fatal, FatalError};

    #[test]
    fn attaching_twice_is_refused() {
        let vm = VirtualMachine::new(VMOptions::default()).unwrap();
        let other = VirtualMachine::new(VMOptions::default()).unwrap();
        let thread = vm.attach_current_thread().unwrap();
        assert_eq!(vm.thread_count(), 1);
        assert!(matches!(vm.attach_current_thread(), Err(Error::AlreadyAttached)));
        assert!(matches!(other.attach_current_thread(), Err(Error::AlreadyAttached)));

        drop(thread);
        assert_eq!(vm.thread_count(), 0);
        assert!(Thread::current().is_none());
        let again = vm.attach_current_thread().unwrap();
        assert!(Arc::ptr_eq(&Thread::current().unwrap(), again.thread()));
    }

    #[test]
    fn safe_regions_nest_and_restore_state() {
        let vm = VirtualMachine::new(VMOptions::default()).unwrap();
        let thread = vm.attach_current_thread().unwrap();
        assert_eq!(thread.gc_state(), GC_STATE_RUNNING);

        let inner = thread.safe_region(|| {
            assert!(thread.scannable_stack().is_some());
            thread.safe_region(|| thread.gc_state())
        });
        assert_eq!(inner, GC_STATE_SAFE);
        assert_eq!(thread.gc_state(), GC_STATE_RUNNING);

        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            thread.safe_region(|| panic!("inside"))
        }));
        assert!(panicked.is_err());
        assert_eq!(thread.gc_state(), GC_STATE_RUNNING);
    }

    #[test]
    fn spawned_threads_attach_for_their_lifetime() {
        let vm = VirtualMachine::new(VMOptions::default()).unwrap();
        let handle = spawn_thread(&vm, |thread| {
            (thread.vm().thread_count(), Thread::current().map(|t| t.id()) == Some(thread.id()))
        })
        .unwrap();
        assert_eq!(handle.join().unwrap(), (1, true));
        assert_eq!(vm.thread_count(), 0);
    }

    #[test]
    fn fatal_policy_follows_the_attached_machine() {
        let lenient = VirtualMachine::new(VMOptions::default()).unwrap();
        let mut options = VMOptions::default();
        options.abort_on_fatal = true;
        let strict = VirtualMachine::new(options).unwrap();

        assert!(!abort_on_fatal());
        let handle = spawn_thread(&strict, |_| abort_on_fatal()).unwrap();
        assert!(handle.join().unwrap());

        // Created after `lenient`, but does not change its policy.
        let thread = lenient.attach_current_thread().unwrap();
        assert!(!abort_on_fatal());
        let payload =
            std::panic::catch_unwind(|| fatal(FatalKind::Internal, "contained")).unwrap_err();
        assert_eq!(FatalError::from_panic(&*payload).unwrap().kind, FatalKind::Internal);
        drop(thread);
    }
}
