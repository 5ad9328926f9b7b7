use super::memory::{PROCESS_STACKS_END, PROCESS_STACKS_START};

pub const MAX_PROCESSES: usize = 64;
pub const MAX_NAME_LEN: usize = 31;

pub const STACK_SIZE: u32 = 4096;
pub const STACK_SLOTS: u32 = (PROCESS_STACKS_END - PROCESS_STACKS_START) / STACK_SIZE;

// Initial heap arena handed to each process, carved from the kernel heap
pub const PROCESS_HEAP_SIZE: u32 = 4096;

pub const DEFAULT_TIME_SLICE: u32 = 10; // ticks
pub const IDLE_PRIORITY: u32 = 0;

/// IF set, reserved bit 1 set.
pub const INITIAL_EFLAGS: u32 = 0x202;
