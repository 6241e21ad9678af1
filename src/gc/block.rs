//! Fixed-size cells carved out of aligned blocks.

use std::{mem::size_of, ptr::null_mut};

use super::virtual_memory::VirtualMemory;
use crate::runtime::{object::ObjectHeader, value::Kind};

pub const BLOCK_SIZE: usize = 64 * 1024;

/// Cell sizes in bytes, header included. Bigger requests go to the large
/// object space.
pub const SIZE_CLASSES: [usize; 17] = [
    16, 24, 32, 48, 64, 80, 96, 128, 160, 192, 256, 384, 512, 768, 1024, 1536, 2048,
];

pub fn size_class_for(bytes: usize) -> Option<usize> {
    let class = SIZE_CLASSES.partition_point(|&size| size < bytes);
    (class < SIZE_CLASSES.len()).then_some(class)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SweepResult {
    pub freed_objects: usize,
    pub freed_bytes: usize,
    pub live_bytes: usize,
}

/// A [`BLOCK_SIZE`] aligned mapping split into cells of one size. Free
/// cells have a zero header and hold the next free cell in the word after it.
pub struct Block {
    memory: VirtualMemory,
    cell_size: usize,
    cells: usize,
    free_list: *mut u8,
    free_cells: usize,
}

unsafe impl Send for Block {}

impl Block {
    pub fn new(cell_size: usize) -> Option<Block> {
        let memory = VirtualMemory::allocate_aligned(BLOCK_SIZE, BLOCK_SIZE, "heap block")?;
        let mut block = Block {
            memory,
            cell_size,
            cells: BLOCK_SIZE / cell_size,
            free_list: null_mut(),
            free_cells: 0,
        };
        for index in (0..block.cells).rev() {
            unsafe { block.push_free(block.cell(index)) };
        }
        Some(block)
    }

    pub fn start(&self) -> usize {
        self.memory.start()
    }

    pub fn cell_size(&self) -> usize {
        self.cell_size
    }

    pub fn has_free_cells(&self) -> bool {
        self.free_cells != 0
    }

    pub fn is_empty(&self) -> bool {
        self.free_cells == self.cells
    }

    fn cell(&self, index: usize) -> *mut u8 {
        (self.start() + index * self.cell_size) as *mut u8
    }

    unsafe fn push_free(&mut self, cell: *mut u8) {
        cell.add(size_of::<ObjectHeader>())
            .cast::<*mut u8>()
            .write(self.free_list);
        self.free_list = cell;
        self.free_cells += 1;
    }

    /// Pops a zeroed cell.
    pub fn allocate(&mut self) -> Option<*mut ObjectHeader> {
        if self.free_list.is_null() {
            return None;
        }
        unsafe {
            let cell = self.free_list;
            let link = cell.add(size_of::<ObjectHeader>()).cast::<*mut u8>();
            self.free_list = link.read();
            link.write(null_mut());
            self.free_cells -= 1;
            Some(cell.cast())
        }
    }

    /// Allocated cell containing `address`, if any.
    pub fn cell_containing(&self, address: usize) -> Option<*mut ObjectHeader> {
        let index = (address - self.start()) / self.cell_size;
        if index >= self.cells {
            return None;
        }
        let cell = self.cell(index).cast::<ObjectHeader>();
        if unsafe { (*cell).kind() } == Kind::Free {
            return None;
        }
        Some(cell)
    }

    /// Clears marks of live cells and zeroes and frees unmarked ones.
    pub fn sweep(&mut self) -> SweepResult {
        let mut result = SweepResult::default();
        self.free_list = null_mut();
        self.free_cells = 0;

        for index in (0..self.cells).rev() {
            let cell = self.cell(index);
            unsafe {
                let header = &*cell.cast::<ObjectHeader>();
                if header.kind() != Kind::Free {
                    if header.is_marked() {
                        header.clear_mark();
                        result.live_bytes += self.cell_size;
                        continue;
                    }
                    result.freed_objects += 1;
                    result.freed_bytes += self.cell_size;
                }
                core::ptr::write_bytes(cell, 0, self.cell_size);
                self.push_free(cell);
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_classes_cover_requests() {
        assert_eq!(size_class_for(1), Some(0));
        assert_eq!(size_class_for(16), Some(0));
        assert_eq!(size_class_for(17), Some(1));
        assert_eq!(size_class_for(2048), Some(SIZE_CLASSES.len() - 1));
        assert_eq!(size_class_for(2049), None);
        for size in SIZE_CLASSES {
            assert_eq!(size % 8, 0);
        }
    }

    #[test]
    fn cells_are_distinct_and_swept_back() {
        let mut block = Block::new(32).expect("block");
        let a = block.allocate().unwrap();
        let b = block.allocate().unwrap();
        assert_ne!(a, b);
        assert_eq!(b as usize - a as usize, 32);

        unsafe {
            a.write(ObjectHeader::new(Kind::Cons, 2));
            b.write(ObjectHeader::new(Kind::Cons, 2));
            assert!((*a).try_mark());
        }

        let result = block.sweep();
        assert_eq!(result.freed_objects, 1);
        assert_eq!(result.live_bytes, 32);
        assert!(block.cell_containing(a as usize + 8).is_some());
        assert!(block.cell_containing(b as usize).is_none());
        assert!(!unsafe { (*a).is_marked() });
    }
}
