use crate::constants::memory::{
    BITMAP_ENTRY_SIZE, FRAME_SIZE, FULL_BITMAP_ENTRY, MAX_BITMAP_ENTRIES, MAX_PHYSICAL_MEMORY,
};

use super::{
    addr::{PhysAddr, PhysFrame},
    frame_allocator::{FrameAllocator, FrameDeallocator, FrameError},
};

/// One bit per 4 KiB frame, 1 = allocated, 0 = free.
pub struct BitmapFrameAllocator {
    total_frames: usize,
    free_frames: usize,
    reserved_frames: usize,
    bitmap_size: usize,
    bitmap: [u32; MAX_BITMAP_ENTRIES],
}

impl BitmapFrameAllocator {
    /// Tracks no memory; every allocation fails until [`reset`](Self::reset).
    pub const fn empty() -> Self {
        Self {
            total_frames: 0,
            free_frames: 0,
            reserved_frames: 0,
            bitmap_size: 0,
            bitmap: [0; MAX_BITMAP_ENTRIES],
        }
    }

    /// Builds the bitmap for `total_bytes` of physical memory. Every frame
    /// below `reserved_end` (kernel image, heap, stacks) stays allocated for
    /// the lifetime of the kernel.
    pub fn init(total_bytes: usize, reserved_end: u32) -> Result<Self, FrameError> {
        let mut allocator = Self::empty();
        allocator.reset(total_bytes, reserved_end)?;
        Ok(allocator)
    }

    /// [`init`](Self::init) without moving the bitmap. On error the
    /// allocator is left as it was.
    pub fn reset(&mut self, total_bytes: usize, reserved_end: u32) -> Result<(), FrameError> {
        let tracked_bytes = if total_bytes > MAX_PHYSICAL_MEMORY {
            log::warn!(
                "Ignoring {} KiB of physical memory above the bitmap limit",
                (total_bytes - MAX_PHYSICAL_MEMORY) / 1024
            );
            MAX_PHYSICAL_MEMORY
        } else {
            total_bytes
        };

        let total_frames = tracked_bytes / FRAME_SIZE;
        let first_free = (reserved_end as usize).div_ceil(FRAME_SIZE);
        if first_free >= total_frames {
            return Err(FrameError::InsufficientMemory);
        }

        self.total_frames = total_frames;
        self.free_frames = 0;
        self.reserved_frames = first_free;
        self.bitmap_size = total_frames.div_ceil(BITMAP_ENTRY_SIZE);
        self.bitmap.fill(FULL_BITMAP_ENTRY);

        self.free_region(first_free, total_frames);

        log::info!(
            "Frame bitmap: {} frames, {} free, {} entries",
            self.total_frames,
            self.free_frames,
            self.bitmap_size
        );
        Ok(())
    }

    /// Mark frames [start_frame, end_frame) as free.
    fn free_region(&mut self, start_frame: usize, end_frame: usize) {
        for frame_index in start_frame..end_frame {
            self.clear_bit(frame_index);
        }
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    pub fn reserved_frames(&self) -> usize {
        self.reserved_frames
    }

    /// Frames handed out by `allocate_frame` and not yet freed.
    pub fn outstanding_frames(&self) -> usize {
        self.total_frames - self.free_frames - self.reserved_frames
    }

    /// Frames past the end of tracked memory count as used.
    pub fn is_frame_used(&self, frame: PhysFrame) -> bool {
        let frame_index = frame.number() as usize;
        frame_index >= self.total_frames || self.is_bit_set(frame_index)
    }

    /// First-fit by ascending frame index.
    pub fn allocate(&mut self) -> Option<PhysFrame> {
        let (entry_index, entry) = self.bitmap[..self.bitmap_size]
            .iter()
            .enumerate()
            .find(|(_, entry)| **entry != FULL_BITMAP_ENTRY)?;

        let bit_index = (!entry).trailing_zeros() as usize;
        let frame_index = entry_index * BITMAP_ENTRY_SIZE + bit_index;
        if frame_index >= self.total_frames {
            return None;
        }

        self.set_bit(frame_index);
        Some(PhysFrame::containing_address(PhysAddr::new(
            (frame_index * FRAME_SIZE) as u32,
        )))
    }

    /// Clears the frame's bit. Freeing a free frame leaves the bitmap alone
    /// and reports `AlreadyFree`.
    pub fn free(&mut self, frame: PhysFrame) -> Result<(), FrameError> {
        let frame_index = frame.number() as usize;
        if frame_index >= self.total_frames {
            return Err(FrameError::OutOfRange);
        }
        if !self.is_bit_set(frame_index) {
            return Err(FrameError::AlreadyFree);
        }
        self.clear_bit(frame_index);
        Ok(())
    }

    fn set_bit(&mut self, frame_index: usize) {
        let mask = 1 << (frame_index % BITMAP_ENTRY_SIZE);
        let entry = &mut self.bitmap[frame_index / BITMAP_ENTRY_SIZE];
        if *entry & mask == 0 {
            *entry |= mask;
            self.free_frames -= 1;
        }
    }

    fn clear_bit(&mut self, frame_index: usize) {
        let mask = 1 << (frame_index % BITMAP_ENTRY_SIZE);
        let entry = &mut self.bitmap[frame_index / BITMAP_ENTRY_SIZE];
        if *entry & mask != 0 {
            *entry &= !mask;
            self.free_frames += 1;
        }
    }

    fn is_bit_set(&self, frame_index: usize) -> bool {
        let mask = 1 << (frame_index % BITMAP_ENTRY_SIZE);
        (self.bitmap[frame_index / BITMAP_ENTRY_SIZE] & mask) != 0
    }
}

unsafe impl FrameAllocator for BitmapFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        self.allocate()
    }
}

impl FrameDeallocator for BitmapFrameAllocator {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame) -> Result<(), FrameError> {
        self.free(frame)
    }
}
