//! Physical layout and allocator constants for the 32-bit kernel.

pub const FRAME_SIZE: usize = 4096;
pub const PAGE_SIZE: u32 = 4096;
pub const PAGE_ENTRIES: usize = 1024;

pub const BITMAP_ENTRY_SIZE: usize = 32;
pub const FULL_BITMAP_ENTRY: u32 = 0xFFFF_FFFF;

// Bitmap storage is static, so anything installed above this is ignored
pub const MAX_PHYSICAL_MEMORY: usize = 1024 * 1024 * 1024; // 1 GiB
pub const MAX_FRAMES: usize = MAX_PHYSICAL_MEMORY / FRAME_SIZE;
pub const MAX_BITMAP_ENTRIES: usize = MAX_FRAMES / BITMAP_ENTRY_SIZE;

pub const KERNEL_IMAGE_START: u32 = 0x0010_0000;
pub const KERNEL_IMAGE_END: u32 = 0x0020_0000;

pub const KERNEL_HEAP_START: u32 = 0x0020_0000;
pub const KERNEL_HEAP_END: u32 = 0x0040_0000;

pub const PROCESS_STACKS_START: u32 = 0x0040_0000;
pub const PROCESS_STACKS_END: u32 = 0x0080_0000;

/// Everything below this address stays allocated in the frame bitmap.
pub const RESERVED_END: u32 = PROCESS_STACKS_END;

/// Bookkeeping footprint charged to every heap block.
pub const HEAP_BLOCK_HEADER_SIZE: u32 = 16;
/// A free block is only split when the remainder exceeds header + slop.
pub const HEAP_SPLIT_SLOP: u32 = 16;
pub const HEAP_ALIGN: u32 = 4;
pub const MAX_HEAP_BLOCKS: usize = 512;
