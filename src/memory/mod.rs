pub mod addr;
pub mod bitmap_frame_allocator;
pub mod frame_allocator;
pub mod heap;
pub mod paging;

use core::fmt;

pub use addr::{PhysAddr, PhysFrame, VirtAddr};
pub use paging::{Directory, PageFlags, PhysOffset};

/// Snapshot for `free`/`meminfo` style consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub total_bytes: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub total_pages: usize,
    pub free_pages: usize,
    pub heap_used_bytes: usize,
    pub heap_free_bytes: usize,
}

impl MemoryStats {
    pub fn used_pages(&self) -> usize {
        self.total_pages - self.free_pages
    }
}

impl fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Memory Information:")?;
        writeln!(f, "==================")?;
        writeln!(f, "Total memory: {} KB", self.total_bytes / 1024)?;
        writeln!(f, "Used memory:  {} KB", self.used_bytes / 1024)?;
        writeln!(f, "Free memory:  {} KB", self.free_bytes / 1024)?;
        writeln!(f, "Total pages:  {}", self.total_pages)?;
        writeln!(f, "Free pages:   {}", self.free_pages)?;
        writeln!(f, "Used pages:   {}", self.used_pages())?;
        writeln!(f, "Heap used:    {} bytes", self.heap_used_bytes)?;
        write!(f, "Heap free:    {} bytes", self.heap_free_bytes)
    }
}
