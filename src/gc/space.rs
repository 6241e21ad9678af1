//! Object storage: one pool of blocks per size class plus a large object space.

use std::{
    collections::{BTreeMap, HashMap},
    mem::size_of,
};

use super::{
    block::{size_class_for, Block, SweepResult, BLOCK_SIZE, SIZE_CLASSES},
    virtual_memory::VirtualMemory,
};
use crate::{
    runtime::{
        object::{ObjectHeader, HEADER_WORDS},
        value::Kind,
    },
    utils::round_down,
};

struct Pool {
    blocks: Vec<Block>,
    /// First block that may still have free cells.
    cursor: usize,
}

pub struct Space {
    pools: Vec<Pool>,
    /// Block base address to (size class, block index).
    block_index: HashMap<usize, (usize, usize)>,
    large: BTreeMap<usize, VirtualMemory>,
    footprint: usize,
    max_footprint: usize,
}

impl Space {
    pub fn new(max_footprint: usize) -> Self {
        Self {
            pools: SIZE_CLASSES
                .iter()
                .map(|_| Pool {
                    blocks: vec![],
                    cursor: 0,
                })
                .collect(),
            block_index: HashMap::new(),
            large: BTreeMap::new(),
            footprint: 0,
            max_footprint,
        }
    }

    /// Bytes of OS memory held by the space.
    pub fn footprint(&self) -> usize {
        self.footprint
    }

    /// Bytes a `words` payload occupies, rounded to its cell or pages.
    pub fn allocation_size(words: usize) -> usize {
        let bytes = (HEADER_WORDS + words) * size_of::<usize>();
        match size_class_for(bytes) {
            Some(class) => SIZE_CLASSES[class],
            None => bytes,
        }
    }

    /// Allocates a zeroed object with an initialized header. `None` when the
    /// OS refuses memory or the footprint limit would be exceeded.
    pub fn allocate(&mut self, kind: Kind, words: usize) -> Option<*mut ObjectHeader> {
        let payload_words = u32::try_from(words).ok()?;
        let bytes = (HEADER_WORDS + words) * size_of::<usize>();
        let object = match size_class_for(bytes) {
            Some(class) => self.allocate_small(class)?,
            None => self.allocate_large(bytes)?,
        };
        unsafe { object.write(ObjectHeader::new(kind, payload_words)) };
        Some(object)
    }

    fn allocate_small(&mut self, class: usize) -> Option<*mut ObjectHeader> {
        let pool = &mut self.pools[class];
        while pool.cursor < pool.blocks.len() {
            if let Some(cell) = pool.blocks[pool.cursor].allocate() {
                return Some(cell);
            }
            pool.cursor += 1;
        }

        if self.footprint + BLOCK_SIZE > self.max_footprint {
            return None;
        }
        let mut block = Block::new(SIZE_CLASSES[class])?;
        let cell = block.allocate();
        self.footprint += BLOCK_SIZE;

        let pool = &mut self.pools[class];
        self.block_index
            .insert(block.start(), (class, pool.blocks.len()));
        pool.cursor = pool.blocks.len();
        pool.blocks.push(block);
        cell
    }

    fn allocate_large(&mut self, bytes: usize) -> Option<*mut ObjectHeader> {
        let page_size = super::virtual_memory::page_size();
        let mapped = crate::utils::round_up(bytes, page_size, 0);
        if self.footprint + mapped > self.max_footprint {
            return None;
        }
        let memory = VirtualMemory::allocate(bytes, "large object")?;
        let object = memory.address().cast::<ObjectHeader>();
        self.footprint += memory.size();
        self.large.insert(memory.start(), memory);
        Some(object)
    }

    /// Header of the allocated object containing `address`. Only the object
    /// start matches unless `interior` is set.
    pub fn find_object(&self, address: usize, interior: bool) -> Option<*mut ObjectHeader> {
        if address == 0 {
            return None;
        }

        let object = match self.block_index.get(&round_down(address, BLOCK_SIZE)) {
            Some(&(class, index)) => self.pools[class].blocks[index].cell_containing(address)?,
            None => {
                let (&start, _) = self.large.range(..=address).next_back()?;
                let object = start as *mut ObjectHeader;
                let end = start + (HEADER_WORDS + unsafe { (*object).words() }) * size_of::<usize>();
                if address >= end {
                    return None;
                }
                object
            }
        };

        if !interior && object as usize != address {
            return None;
        }
        Some(object)
    }

    pub fn sweep(&mut self) -> SweepResult {
        let mut total = SweepResult::default();

        for pool in self.pools.iter_mut() {
            for block in pool.blocks.iter_mut() {
                let result = block.sweep();
                total.freed_objects += result.freed_objects;
                total.freed_bytes += result.freed_bytes;
                total.live_bytes += result.live_bytes;
            }
            // Empty blocks go back to the OS, keeping one per class around.
            let mut kept_empty = false;
            let before = pool.blocks.len();
            pool.blocks.retain(|block| {
                if !block.is_empty() {
                    return true;
                }
                !std::mem::replace(&mut kept_empty, true)
            });
            self.footprint -= (before - pool.blocks.len()) * BLOCK_SIZE;
            pool.cursor = 0;
        }

        self.block_index.clear();
        for (class, pool) in self.pools.iter().enumerate() {
            for (index, block) in pool.blocks.iter().enumerate() {
                self.block_index.insert(block.start(), (class, index));
            }
        }

        let mut footprint = self.footprint;
        self.large.retain(|_, memory| {
            let header = unsafe { &*memory.address().cast::<ObjectHeader>() };
            let bytes = (HEADER_WORDS + header.words()) * size_of::<usize>();
            if header.is_marked() {
                header.clear_mark();
                total.live_bytes += bytes;
                true
            } else {
                total.freed_objects += 1;
                total.freed_bytes += bytes;
                footprint -= memory.size();
                false
            }
        });
        self.footprint = footprint;

        total
    }
}
