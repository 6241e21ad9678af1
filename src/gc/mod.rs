//! Conservative mark-sweep heap.
//!
//! Small objects live in size-class pools of [`block::BLOCK_SIZE`] blocks,
//! larger ones get their own mapping. Marking starts from the roots handed
//! in by the virtual machine (stacks are scanned conservatively, everything
//! else precisely) and follows object fields by layout. Sweeping zeroes dead
//! cells so that every allocation comes back zero-initialized.

use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use crate::{
    runtime::{
        error::contract_violation,
        object::FLAG_HAS_FINALIZER,
        value::{Kind, Value},
    },
    utils::formatted_size,
    vm::options::VMOptions,
};

pub mod block;
pub mod conservative;
pub mod mark;
pub mod memory_region;
pub mod roots;
pub mod space;
pub mod stack;
pub mod virtual_memory;

use mark::Marker;
use space::Space;

/// Action run once after its object was found unreachable.
pub type Finalizer = Box<dyn FnOnce(Value) + Send>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes handed out since the heap was created.
    pub bytes_allocated: usize,
    pub objects_allocated: usize,
    pub collections: usize,
    pub objects_reclaimed: usize,
    pub bytes_reclaimed: usize,
    /// Bytes in live objects after the last collection.
    pub live_bytes: usize,
    /// Bytes of OS memory held by the heap.
    pub footprint: usize,
    pub last_pause: Duration,
}

pub struct Heap {
    space: Space,
    stats: HeapStats,
    allocated_since_gc: usize,
    threshold: usize,
    min_heap_size: usize,
    growth_factor: f64,
    interior_pointers: bool,
    finalizers: HashMap<usize, Finalizer>,
    pending_finalizers: VecDeque<(Value, Finalizer)>,
    /// Objects whose finalizer is running right now.
    finalizing: Vec<Value>,
}

impl Heap {
    pub fn new(options: &VMOptions) -> Self {
        Self {
            space: Space::new(options.gc_max_heap_size),
            stats: HeapStats::default(),
            allocated_since_gc: 0,
            threshold: options.gc_min_heap_size,
            min_heap_size: options.gc_min_heap_size,
            growth_factor: options.gc_growth_factor,
            interior_pointers: options.interior_pointers,
            finalizers: HashMap::new(),
            pending_finalizers: VecDeque::new(),
            finalizing: vec![],
        }
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            footprint: self.space.footprint(),
            ..self.stats
        }
    }

    /// Whether allocating `words` more payload words crosses the collection threshold.
    pub fn should_collect(&self, words: usize) -> bool {
        self.stats.live_bytes + self.allocated_since_gc + Space::allocation_size(words)
            > self.threshold
    }

    /// Allocates a zero-initialized object without ever collecting.
    pub fn try_allocate(&mut self, kind: Kind, words: usize) -> Option<Value> {
        let object = self.space.allocate(kind, words)?;
        let bytes = Space::allocation_size(words);
        self.allocated_since_gc += bytes;
        self.stats.bytes_allocated += bytes;
        self.stats.objects_allocated += 1;
        Some(unsafe { Value::from_object(object) })
    }

    /// `true` if `value` is the start of an allocated object.
    pub fn is_live_object(&self, value: Value) -> bool {
        value.is_heap_ref() && self.space.find_object(value.raw(), false).is_some()
    }

    pub fn register_finalizer(&mut self, object: Value, action: Finalizer) {
        if !self.is_live_object(object) {
            contract_violation(|| format!("finalizer for non-object {:#x}", object.raw()));
            return;
        }
        unsafe { (*object.as_object()).set_flag(FLAG_HAS_FINALIZER) };
        self.finalizers.insert(object.raw(), action);
    }

    pub fn has_pending_finalizers(&self) -> bool {
        !self.pending_finalizers.is_empty()
    }

    /// Takes the next queued finalizer. Its object stays reachable until
    /// [`Heap::finish_finalizer`] is called for it.
    pub fn take_pending_finalizer(&mut self) -> Option<(Value, Finalizer)> {
        let (object, action) = self.pending_finalizers.pop_front()?;
        self.finalizing.push(object);
        Some((object, action))
    }

    pub fn finish_finalizer(&mut self, object: Value) {
        if let Some(at) = self.finalizing.iter().rposition(|v| *v == object) {
            self.finalizing.swap_remove(at);
        }
    }

    /// Runs a full collection. `trace_roots` marks everything the heap does
    /// not know about itself.
    pub fn collect(&mut self, trace_roots: impl FnOnce(&mut Marker)) -> HeapStats {
        let start = Instant::now();
        let mut marker = Marker::new(&self.space, self.interior_pointers);

        trace_roots(&mut marker);
        for (object, _) in self.pending_finalizers.iter() {
            marker.mark_value(*object);
        }
        for object in self.finalizing.iter() {
            marker.mark_value(*object);
        }
        marker.drain();

        let unreachable = self
            .finalizers
            .keys()
            .copied()
            .filter(|&addr| !marker.is_marked(unsafe { Value::from_raw(addr) }))
            .collect::<Vec<_>>();
        for addr in unreachable {
            if let Some(action) = self.finalizers.remove(&addr) {
                // Finalizer keys are registered objects, kept until here.
                let object = unsafe { Value::from_raw(addr) };
                unsafe { (*object.as_object()).clear_flag(FLAG_HAS_FINALIZER) };
                marker.mark_value(object);
                self.pending_finalizers.push_back((object, action));
            }
        }
        marker.drain();
        let marked = marker.marked();

        let swept = self.space.sweep();

        self.stats.collections += 1;
        self.stats.objects_reclaimed += swept.freed_objects;
        self.stats.bytes_reclaimed += swept.freed_bytes;
        self.stats.live_bytes = swept.live_bytes;
        self.stats.last_pause = start.elapsed();
        self.allocated_since_gc = 0;
        self.threshold = self
            .min_heap_size
            .max((swept.live_bytes as f64 * self.growth_factor) as usize);

        log::info!(
            target: "gc",
            "collection #{}: {} live in {} objects, reclaimed {} in {} objects, footprint {}, next at {}, pause {:.3}ms",
            self.stats.collections,
            formatted_size(swept.live_bytes),
            marked,
            formatted_size(swept.freed_bytes),
            swept.freed_objects,
            formatted_size(self.space.footprint()),
            formatted_size(self.threshold),
            self.stats.last_pause.as_secs_f64() * 1000.0
        );

        self.stats()
    }
}
