//! The virtual machine: one heap, its root registry, the symbol table and
//! the mutator threads attached to it.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::{
    gc::{memory_region::MemoryRegion, roots::RootRegistry, Finalizer, Heap, HeapStats},
    runtime::{
        error::{fatal_with, FatalKind, Result},
        symbol::SymbolTable,
        value::{Kind, Value},
    },
    sync::Mutex,
    utils::formatted_size,
};

pub mod control;
pub mod options;
pub mod safepoint;
pub mod thread;

use options::VMOptions;
use safepoint::Safepoint;
use thread::Thread;

pub struct VirtualMachine {
    pub(crate) options: VMOptions,
    pub(crate) heap: Mutex<Heap>,
    pub(crate) roots: Mutex<RootRegistry>,
    pub(crate) threads: Mutex<Vec<Arc<Thread>>>,
    pub(crate) symbols: Mutex<SymbolTable>,
    pub(crate) safepoint: Safepoint,
    binding_indices: AtomicUsize,
    pub(crate) next_thread_id: AtomicUsize,
}

impl VirtualMachine {
    pub fn new(options: VMOptions) -> Result<Arc<Self>> {
        options.validate()?;

        log::info!(
            target: "vm",
            "heap {}..{}, growth {}, stack scan {}",
            formatted_size(options.gc_min_heap_size),
            formatted_size(options.gc_max_heap_size),
            options.gc_growth_factor,
            if options.conservative_stack_scan { "on" } else { "off" }
        );

        Ok(Arc::new(Self {
            heap: Mutex::new(Heap::new(&options))?,
            roots: Mutex::new(RootRegistry::default())?,
            threads: Mutex::new(Vec::new())?,
            symbols: Mutex::new(SymbolTable::default())?,
            safepoint: Safepoint::new()?,
            binding_indices: AtomicUsize::new(0),
            next_thread_id: AtomicUsize::new(1),
            options,
        }))
    }

    pub fn options(&self) -> &VMOptions {
        &self.options
    }

    /// Raises a fatal error under this machine's abort policy.
    pub(crate) fn fatal(&self, kind: FatalKind, message: impl Into<String>) -> ! {
        fatal_with(self.options.abort_on_fatal, kind, message)
    }

    pub fn stats(&self) -> HeapStats {
        self.heap.lock(true).stats()
    }

    /// Runs a full collection now, then any finalizers it queued.
    pub fn collect(&self) -> HeapStats {
        let stats = {
            let mut heap = self.heap.lock(true);
            self.collect_locked(&mut heap)
        };
        self.run_finalizers();
        stats
    }

    /// `true` if `value` refers to an object that has not been reclaimed.
    pub fn is_live_object(&self, value: Value) -> bool {
        self.heap.lock(true).is_live_object(value)
    }

    /// Turns a word of unknown origin into a value. Heap references are only
    /// accepted when they name the start of a live object of this machine.
    pub fn decode(&self, bits: usize) -> Option<Value> {
        // Immediates never dereference, so any of them is safe to decode.
        let value = unsafe { Value::from_raw(bits) };
        if !value.is_heap_ref() || self.is_live_object(value) {
            Some(value)
        } else {
            None
        }
    }

    /// [`Value::classify`] for an unchecked word: addresses that are not
    /// objects of this machine are [`Kind::Invalid`].
    pub fn classify_raw(&self, bits: usize) -> Kind {
        self.decode(bits).map_or(Kind::Invalid, Value::classify)
    }

    /// Adds `location` to the precise roots.
    ///
    /// # Safety
    ///
    /// `location` must stay valid and readable until it is unregistered.
    pub unsafe fn register_root(&self, location: *const Value) {
        if self.roots.lock(true).register_location(location) {
            log::debug!(target: "gc", "root registered at {:p}", location);
        }
    }

    pub fn unregister_root(&self, location: *const Value) {
        if self.roots.lock(true).unregister_location(location) {
            log::debug!(target: "gc", "root unregistered at {:p}", location);
        }
    }

    /// Memory the collector never scans, even inside a stack or root region.
    pub fn exclude_region(&self, start: usize, end: usize) {
        let region = MemoryRegion::from_range(start, end);
        log::debug!(target: "gc", "excluding {:?}", region);
        self.roots.lock(true).exclusions.exclude(region);
    }

    /// Lifts an exclusion made with the same bounds.
    pub fn include_region(&self, start: usize, end: usize) -> bool {
        let region = MemoryRegion::from_range(start, end);
        log::debug!(target: "gc", "including {:?}", region);
        self.roots.lock(true).exclusions.include(region)
    }

    /// Adds memory that is scanned conservatively on every collection.
    ///
    /// # Safety
    ///
    /// The region must stay mapped and readable until it is removed.
    pub unsafe fn add_root_region(&self, start: usize, end: usize) {
        let region = MemoryRegion::from_range(start, end);
        log::debug!(target: "gc", "root region {:?}", region);
        self.roots.lock(true).add_region(region);
    }

    pub fn remove_root_region(&self, start: usize, end: usize) -> bool {
        self.roots
            .lock(true)
            .remove_region(MemoryRegion::from_range(start, end))
    }

    /// Excludes the data segments of a loaded foreign library.
    pub fn register_foreign_segments(&self, name: &str, segments: Vec<MemoryRegion>) {
        log::debug!(target: "gc", "foreign library {} with {} segments", name, segments.len());
        self.roots.lock(true).register_foreign(name, segments);
    }

    pub fn unregister_foreign_segments(&self, name: &str) -> bool {
        log::debug!(target: "gc", "foreign library {} unloaded", name);
        self.roots.lock(true).unregister_foreign(name)
    }

    pub fn register_finalizer(&self, object: Value, action: Finalizer) {
        self.heap.lock(true).register_finalizer(object, action);
    }

    /// Runs every queued finalizer on the calling thread.
    pub fn run_finalizers(&self) {
        loop {
            let next = self.heap.lock(true).take_pending_finalizer();
            let Some((object, action)) = next else {
                break;
            };
            action(object);
            self.heap.lock(true).finish_finalizer(object);
        }
    }

    pub(crate) fn next_binding_index(&self) -> usize {
        self.binding_indices.fetch_add(1, Ordering::Relaxed)
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.lock(true).len()
    }
}
