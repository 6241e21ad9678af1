use super::{
    conservative,
    memory_region::MemoryRegion,
    roots::ExclusionSet,
    space::Space,
};
use crate::runtime::{
    object::{for_each_value_slot, ObjectHeader},
    value::Value,
};

/// Marking state of one collection: the space being traced and a stack of
/// objects whose fields still have to be visited.
pub struct Marker<'a> {
    space: &'a Space,
    interior_pointers: bool,
    stack: Vec<*mut ObjectHeader>,
    marked: usize,
}

impl<'a> Marker<'a> {
    pub(crate) fn new(space: &'a Space, interior_pointers: bool) -> Self {
        Self {
            space,
            interior_pointers,
            stack: Vec::with_capacity(256),
            marked: 0,
        }
    }

    /// Number of objects marked so far.
    pub fn marked(&self) -> usize {
        self.marked
    }

    #[inline]
    fn mark_object(&mut self, object: *mut ObjectHeader) {
        if unsafe { (*object).try_mark() } {
            self.marked += 1;
            self.stack.push(object);
        }
    }

    /// Marks a precise reference.
    #[inline]
    pub fn mark_value(&mut self, value: Value) {
        if value.is_heap_ref() {
            debug_assert!(
                self.space.find_object(value.raw(), false).is_some(),
                "stale reference {:#x}",
                value.raw()
            );
            self.mark_object(value.as_object());
        }
    }

    /// # Safety
    ///
    /// `slot` must be readable.
    pub unsafe fn mark_slot(&mut self, slot: *const Value) {
        self.mark_value(slot.read());
    }

    /// Marks the object `word` points into, if it points into one.
    #[inline]
    pub fn mark_ambiguous(&mut self, word: usize) {
        if let Some(object) = self.space.find_object(word, self.interior_pointers) {
            self.mark_object(object);
        }
    }

    /// Conservatively scans `region` except for the excluded parts.
    ///
    /// # Safety
    ///
    /// Every non-excluded part of `region` must be readable.
    pub unsafe fn scan_region(&mut self, region: MemoryRegion, exclusions: &ExclusionSet) {
        exclusions.for_each_scannable(region, |piece| {
            conservative::scan_words(piece, |word| self.mark_ambiguous(word));
        });
    }

    pub fn is_marked(&self, value: Value) -> bool {
        value.is_heap_ref() && unsafe { (*value.as_object()).is_marked() }
    }

    /// Traces everything reachable from the objects marked so far.
    pub fn drain(&mut self) {
        while let Some(object) = self.stack.pop() {
            unsafe {
                for_each_value_slot(object, |slot| self.mark_value(slot.read()));
            }
        }
    }
}
