//! Explicit roots and the regions the collector may or may not scan.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use super::memory_region::MemoryRegion;
use crate::{runtime::value::Value, vm::VirtualMachine};

/// Address ranges that are never scanned conservatively, kept sorted by start.
#[derive(Default, Debug)]
pub struct ExclusionSet {
    regions: Vec<MemoryRegion>,
}

impl ExclusionSet {
    pub fn exclude(&mut self, region: MemoryRegion) {
        if region.is_empty() {
            return;
        }
        let at = self.regions.partition_point(|r| r.start() <= region.start());
        self.regions.insert(at, region);
    }

    /// Lifts one exclusion of exactly `region`. Returns `false` if there was none.
    pub fn include(&mut self, region: MemoryRegion) -> bool {
        match self.regions.iter().position(|r| *r == region) {
            Some(at) => {
                self.regions.remove(at);
                true
            }
            None => false,
        }
    }

    pub fn is_excluded(&self, address: usize) -> bool {
        self.regions.iter().any(|r| r.contains(address))
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Calls `visit` with the parts of `region` not covered by any exclusion.
    pub fn for_each_scannable(&self, region: MemoryRegion, mut visit: impl FnMut(MemoryRegion)) {
        let mut cursor = region.start();
        for excluded in self.regions.iter().filter(|r| r.overlaps(&region)) {
            if excluded.start() > cursor {
                visit(MemoryRegion::from_range(cursor, excluded.start()));
            }
            cursor = cursor.max(excluded.end());
        }
        if cursor < region.end() {
            visit(MemoryRegion::from_range(cursor, region.end()));
        }
    }
}

/// Global root locations, conservatively scanned root regions and scan
/// exclusions. Guarded by its own lock inside the virtual machine.
#[derive(Default)]
pub struct RootRegistry {
    locations: HashSet<usize>,
    regions: Vec<MemoryRegion>,
    pub(crate) exclusions: ExclusionSet,
    foreign: HashMap<String, Vec<MemoryRegion>>,
}

impl RootRegistry {
    pub fn register_location(&mut self, location: *const Value) -> bool {
        self.locations.insert(location as usize)
    }

    pub fn unregister_location(&mut self, location: *const Value) -> bool {
        self.locations.remove(&(location as usize))
    }

    pub fn add_region(&mut self, region: MemoryRegion) {
        self.regions.push(region);
    }

    pub fn remove_region(&mut self, region: MemoryRegion) -> bool {
        match self.regions.iter().position(|r| *r == region) {
            Some(at) => {
                self.regions.swap_remove(at);
                true
            }
            None => false,
        }
    }

    /// Excludes every segment of a loaded library. Registering the same name
    /// again replaces its previous segments.
    pub fn register_foreign(&mut self, name: &str, segments: Vec<MemoryRegion>) {
        self.unregister_foreign(name);
        for segment in segments.iter() {
            self.exclusions.exclude(*segment);
        }
        self.foreign.insert(name.to_owned(), segments);
    }

    pub fn unregister_foreign(&mut self, name: &str) -> bool {
        match self.foreign.remove(name) {
            Some(segments) => {
                for segment in segments {
                    self.exclusions.include(segment);
                }
                true
            }
            None => false,
        }
    }

    pub fn foreign_segments(&self, name: &str) -> Option<&[MemoryRegion]> {
        self.foreign.get(name).map(|segments| segments.as_slice())
    }

    pub fn locations(&self) -> impl Iterator<Item = *const Value> + '_ {
        self.locations.iter().map(|&addr| addr as *const Value)
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }
}

/// An owned value slot that is a global root for as long as it lives.
pub struct GlobalRoot {
    vm: Arc<VirtualMachine>,
    slot: Box<Value>,
}

impl GlobalRoot {
    pub fn new(vm: &Arc<VirtualMachine>, value: Value) -> Self {
        let slot = Box::new(value);
        unsafe { vm.register_root(&*slot) };
        Self {
            vm: vm.clone(),
            slot,
        }
    }

    pub fn get(&self) -> Value {
        *self.slot
    }

    pub fn set(&mut self, value: Value) {
        *self.slot = value;
    }
}

impl Drop for GlobalRoot {
    fn drop(&mut self) {
        self.vm.unregister_root(&*self.slot);
    }
}

impl std::fmt::Debug for GlobalRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("GlobalRoot").field(&self.get()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pieces(set: &ExclusionSet, region: MemoryRegion) -> Vec<(usize, usize)> {
        let mut out = vec![];
        set.for_each_scannable(region, |r| out.push((r.start(), r.end())));
        out
    }

    #[test]
    fn exclusions_punch_holes() {
        let mut set = ExclusionSet::default();
        set.exclude(MemoryRegion::from_range(0x1400, 0x1800));
        set.exclude(MemoryRegion::from_range(0x1100, 0x1200));
        set.exclude(MemoryRegion::from_range(0x9000, 0xa000));

        assert_eq!(
            pieces(&set, MemoryRegion::from_range(0x1000, 0x2000)),
            vec![(0x1000, 0x1100), (0x1200, 0x1400), (0x1800, 0x2000)]
        );
        assert!(set.is_excluded(0x1150));
        assert!(!set.is_excluded(0x1250));
    }

    #[test]
    fn overlapping_exclusions_and_include() {
        let mut set = ExclusionSet::default();
        let a = MemoryRegion::from_range(0x1000, 0x1800);
        let b = MemoryRegion::from_range(0x1400, 0x1c00);
        set.exclude(a);
        set.exclude(b);
        assert_eq!(
            pieces(&set, MemoryRegion::from_range(0x0800, 0x2000)),
            vec![(0x0800, 0x1000), (0x1c00, 0x2000)]
        );

        assert!(set.include(a));
        assert!(!set.include(a));
        assert_eq!(
            pieces(&set, MemoryRegion::from_range(0x0800, 0x2000)),
            vec![(0x0800, 0x1400), (0x1c00, 0x2000)]
        );
    }

    #[test]
    fn foreign_segments_toggle_exclusions() {
        let mut roots = RootRegistry::default();
        let data = MemoryRegion::from_range(0x5000, 0x6000);
        let bss = MemoryRegion::from_range(0x7000, 0x7400);
        roots.register_foreign("libfoo.so", vec![data, bss]);
        assert!(roots.exclusions.is_excluded(0x5008));
        assert!(roots.exclusions.is_excluded(0x7010));
        assert_eq!(roots.foreign_segments("libfoo.so"), Some(&[data, bss][..]));

        assert!(roots.unregister_foreign("libfoo.so"));
        assert!(roots.exclusions.is_empty());
        assert!(!roots.unregister_foreign("libfoo.so"));
    }
}
