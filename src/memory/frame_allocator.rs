//! Frame allocation traits shared by the bitmap allocator and page-table code

use core::fmt;

use super::addr::PhysFrame;

/// Hands out unused physical frames.
///
/// # Safety
///
/// Implementations must never return a frame that is already in use.
pub unsafe trait FrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame>;
}

/// Returns frames to an allocator.
pub trait FrameDeallocator {
    /// # Safety
    ///
    /// The frame must no longer be referenced by any live mapping.
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame) -> Result<(), FrameError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Freed a frame whose bit was already clear. The bitmap is unchanged.
    AlreadyFree,
    /// Frame lies beyond the memory tracked by the bitmap.
    OutOfRange,
    /// Installed memory does not extend past the permanently reserved area.
    InsufficientMemory,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::AlreadyFree => write!(f, "Frame is already free"),
            FrameError::OutOfRange => write!(f, "Frame is outside tracked memory"),
            FrameError::InsufficientMemory => {
                write!(f, "Not enough physical memory above the reserved area")
            }
        }
    }
}
