pub mod syscall_handlers;

pub use syscall_handlers::{Syscall, SyscallError, SyscallReturn};
