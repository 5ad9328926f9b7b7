//! The Kernel Heap
//!
//! First-fit allocator over a reserved byte range. Block headers live in a
//! fixed arena and link to each other by slot index, in strictly increasing
//! address order. Each block is still charged `HEAP_BLOCK_HEADER_SIZE` bytes
//! of the region, so the region is always fully accounted for:
//! `sum(size) + blocks * HEAP_BLOCK_HEADER_SIZE == region size`.

use core::fmt;

use crate::constants::memory::{
    HEAP_ALIGN, HEAP_BLOCK_HEADER_SIZE, HEAP_SPLIT_SLOP, MAX_HEAP_BLOCKS,
};

type BlockId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapBlock {
    /// Payload address handed to the caller.
    pub address: u32,
    /// Payload bytes following the header.
    pub size: u32,
    pub free: bool,
    next: Option<BlockId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    OutOfMemory,
    /// Address was never returned by `allocate`.
    UnknownAddress,
    DoubleFree,
    RegionTooSmall,
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::OutOfMemory => write!(f, "Kernel heap out of memory"),
            HeapError::UnknownAddress => write!(f, "Address was not allocated from the heap"),
            HeapError::DoubleFree => write!(f, "Heap block is already free"),
            HeapError::RegionTooSmall => write!(f, "Heap region cannot hold a single block"),
        }
    }
}

pub struct KernelHeap {
    region_start: u32,
    region_end: u32,
    blocks: [Option<HeapBlock>; MAX_HEAP_BLOCKS],
    head: Option<BlockId>,
    used_bytes: u32,
}

impl KernelHeap {
    /// A heap over no memory. Every allocation fails until
    /// [`reset`](Self::reset).
    pub const fn empty() -> Self {
        KernelHeap {
            region_start: 0,
            region_end: 0,
            blocks: [None; MAX_HEAP_BLOCKS],
            head: None,
            used_bytes: 0,
        }
    }

    /// One free block spanning [region_start, region_end).
    pub fn init(region_start: u32, region_end: u32) -> Result<Self, HeapError> {
        let mut heap = Self::empty();
        heap.reset(region_start, region_end)?;
        Ok(heap)
    }

    /// Reinitialises the heap where it lives, discarding every block.
    pub fn reset(&mut self, region_start: u32, region_end: u32) -> Result<(), HeapError> {
        if region_end <= region_start || region_end - region_start <= HEAP_BLOCK_HEADER_SIZE {
            return Err(HeapError::RegionTooSmall);
        }

        self.region_start = region_start;
        self.region_end = region_end;
        self.blocks.fill(None);
        self.used_bytes = 0;

        let address = region_start + HEAP_BLOCK_HEADER_SIZE;
        self.blocks[0] = Some(HeapBlock {
            address,
            size: region_end - address,
            free: true,
            next: None,
        });
        self.head = Some(0);

        log::info!(
            "Kernel heap at {:#x}..{:#x} ({} KiB)",
            region_start,
            region_end,
            (region_end - region_start) / 1024
        );
        Ok(())
    }

    /// First-fit allocation of `size` bytes rounded up to 4. A zero-byte
    /// request still gets its own block and address.
    pub fn allocate(&mut self, size: u32) -> Result<u32, HeapError> {
        let size = size
            .checked_add(HEAP_ALIGN - 1)
            .ok_or(HeapError::OutOfMemory)?
            & !(HEAP_ALIGN - 1);

        let mut cursor = self.head;
        while let Some(id) = cursor {
            let Some(block) = self.blocks[id] else { break };

            if block.free && block.size >= size {
                let split_threshold = size
                    .saturating_add(HEAP_BLOCK_HEADER_SIZE)
                    .saturating_add(HEAP_SPLIT_SLOP);

                if block.size > split_threshold {
                    match self.spare_slot() {
                        Some(spare) => {
                            let tail_address = block.address + size + HEAP_BLOCK_HEADER_SIZE;
                            self.blocks[spare] = Some(HeapBlock {
                                address: tail_address,
                                size: block.size - size - HEAP_BLOCK_HEADER_SIZE,
                                free: true,
                                next: block.next,
                            });
                            self.block_mut(id).size = size;
                            self.block_mut(id).next = Some(spare);
                        }
                        None => log::debug!("Heap arena full, handing out whole block"),
                    }
                }

                let block = self.block_mut(id);
                block.free = false;
                let (address, granted) = (block.address, block.size);
                self.used_bytes += granted;
                return Ok(address);
            }
            cursor = block.next;
        }

        log::warn!("Kernel heap cannot satisfy {} bytes", size);
        Err(HeapError::OutOfMemory)
    }

    /// Frees the block whose payload starts at `address`, merging it with
    /// free neighbours. Unknown addresses and double frees leave the list
    /// untouched.
    pub fn free(&mut self, address: u32) -> Result<(), HeapError> {
        let id = self
            .iter_ids()
            .find(|&id| self.block(id).address == address)
            .ok_or(HeapError::UnknownAddress)?;

        if self.block(id).free {
            return Err(HeapError::DoubleFree);
        }

        let size = self.block(id).size;
        self.block_mut(id).free = true;
        self.used_bytes -= size;

        // merge with successor
        if let Some(next_id) = self.block(id).next {
            let next = self.block(next_id);
            if next.free {
                let block = self.block_mut(id);
                block.size += next.size + HEAP_BLOCK_HEADER_SIZE;
                block.next = next.next;
                self.blocks[next_id] = None;
            }
        }

        // merge into predecessor
        let prev = self
            .iter_ids()
            .find(|&prev_id| self.block(prev_id).next == Some(id));
        if let Some(prev_id) = prev {
            if self.block(prev_id).free {
                let block = self.block(id);
                let prev = self.block_mut(prev_id);
                prev.size += block.size + HEAP_BLOCK_HEADER_SIZE;
                prev.next = block.next;
                self.blocks[id] = None;
            }
        }

        Ok(())
    }

    /// Blocks in address order.
    pub fn blocks(&self) -> impl Iterator<Item = &HeapBlock> + '_ {
        self.iter_ids().map(move |id| self.block_ref(id))
    }

    pub fn region_size(&self) -> u32 {
        self.region_end - self.region_start
    }

    pub fn used_bytes(&self) -> u32 {
        self.used_bytes
    }

    pub fn free_bytes(&self) -> u32 {
        self.blocks().filter(|b| b.free).map(|b| b.size).sum()
    }

    pub fn block_count(&self) -> usize {
        self.blocks().count()
    }

    fn iter_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            let id = cursor?;
            cursor = self.blocks[id].and_then(|b| b.next);
            Some(id)
        })
    }

    fn spare_slot(&self) -> Option<BlockId> {
        self.blocks.iter().position(Option::is_none)
    }

    // Linked ids always name occupied slots.
    fn block(&self, id: BlockId) -> HeapBlock {
        *self.block_ref(id)
    }

    fn block_ref(&self, id: BlockId) -> &HeapBlock {
        match &self.blocks[id] {
            Some(block) => block,
            None => unreachable!("heap list links to empty slot {}", id),
        }
    }

    fn block_mut(&mut self, id: BlockId) -> &mut HeapBlock {
        match &mut self.blocks[id] {
            Some(block) => block,
            None => unreachable!("heap list links to empty slot {}", id),
        }
    }
}
