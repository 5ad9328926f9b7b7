// Syscall numbers
pub const SYSCALL_EXIT: usize = 1;
pub const SYSCALL_WRITE: usize = 4;
pub const SYSCALL_GETPID: usize = 20;
pub const SYSCALL_SLEEP: usize = 35;

pub const STDOUT: usize = 1;

/// Returned to the caller for unknown syscalls and rejected requests (-1).
pub const SYSCALL_FAILURE: usize = usize::MAX;
