use std::fmt;

/// A half-open address range `[start, end)`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MemoryRegion {
    start: usize,
    end: usize,
}

impl MemoryRegion {
    /// An inverted range is treated as empty.
    pub fn from_range(start: usize, end: usize) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn pointer(&self) -> *mut u8 {
        self.start as *mut u8
    }

    pub fn size(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.start && address < self.end
    }

    pub fn overlaps(&self, other: &MemoryRegion) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containment_and_overlap() {
        let a = MemoryRegion::from_range(0x1000, 0x2000);
        let b = MemoryRegion::from_range(0x1800, 0x3000);
        let c = MemoryRegion::from_range(0x2000, 0x2100);
        assert!(a.contains(0x1000));
        assert!(!a.contains(0x2000));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert_eq!(a.size(), 0x1000);
        assert!(MemoryRegion::from_range(0x2000, 0x1000).is_empty());
    }
}
