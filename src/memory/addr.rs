//! 32-bit physical/virtual address types
//!
//! Shaped after the `x86_64` crate's `PhysAddr`/`VirtAddr`/`PhysFrame`, which
//! only cover long mode.

use core::fmt;

use crate::constants::memory::PAGE_SIZE;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u32);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(u32);

impl PhysAddr {
    pub const fn new(addr: u32) -> Self {
        PhysAddr(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl VirtAddr {
    pub const fn new(addr: u32) -> Self {
        VirtAddr(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Index into the page directory (top 10 bits).
    pub const fn directory_index(self) -> usize {
        (self.0 >> 22) as usize
    }

    /// Index into the page table (middle 10 bits).
    pub const fn table_index(self) -> usize {
        ((self.0 >> 12) & 0x3FF) as usize
    }

    pub const fn page_offset(self) -> u32 {
        self.0 & (PAGE_SIZE - 1)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

/// A 4 KiB physical frame.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysFrame {
    start: PhysAddr,
}

impl PhysFrame {
    pub const fn containing_address(addr: PhysAddr) -> Self {
        PhysFrame {
            start: PhysAddr(addr.0 & !(PAGE_SIZE - 1)),
        }
    }

    pub const fn from_number(number: u32) -> Self {
        PhysFrame {
            start: PhysAddr(number << 12),
        }
    }

    pub const fn start_address(self) -> PhysAddr {
        self.start
    }

    /// The 20-bit frame number stored in page table entries.
    pub const fn number(self) -> u32 {
        self.start.0 >> 12
    }
}

impl fmt::Debug for PhysFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysFrame({:#x})", self.start.0)
    }
}
