use core::{fmt, slice};

use crate::{
    arch::{ContextSwitch, Cpu, InterruptGuard},
    constants::syscalls::{
        STDOUT, SYSCALL_EXIT, SYSCALL_FAILURE, SYSCALL_GETPID, SYSCALL_SLEEP, SYSCALL_WRITE,
    },
    devices::ByteSink,
    kernel::Kernel,
};

/// A decoded system call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall<'a> {
    Exit { code: i32 },
    GetPid,
    Sleep { ms: u32 },
    Write { stream: usize, buf: &'a [u8] },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    Unknown(usize),
    BadStream(usize),
    BadBuffer,
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyscallError::Unknown(num) => write!(f, "Unknown syscall: {}", num),
            SyscallError::BadStream(stream) => write!(f, "Unsupported stream: {}", stream),
            SyscallError::BadBuffer => write!(f, "Invalid user buffer"),
        }
    }
}

impl<'a> Syscall<'a> {
    /// Decodes a syscall number and its three word arguments.
    ///
    /// # Safety
    ///
    /// For `write`, `args[1]` must point to `args[2]` readable bytes that
    /// stay valid for `'a`.
    pub unsafe fn from_raw(num: usize, args: [usize; 3]) -> Result<Self, SyscallError> {
        match num {
            SYSCALL_EXIT => Ok(Syscall::Exit {
                code: args[0] as i32,
            }),
            SYSCALL_GETPID => Ok(Syscall::GetPid),
            SYSCALL_SLEEP => Ok(Syscall::Sleep {
                ms: u32::try_from(args[0]).unwrap_or(u32::MAX),
            }),
            SYSCALL_WRITE => {
                let (ptr, len) = (args[1] as *const u8, args[2]);
                let buf = if len == 0 {
                    &[][..]
                } else if ptr.is_null() {
                    return Err(SyscallError::BadBuffer);
                } else {
                    slice::from_raw_parts(ptr, len)
                };
                Ok(Syscall::Write {
                    stream: args[0],
                    buf,
                })
            }
            _ => Err(SyscallError::Unknown(num)),
        }
    }
}

/// Value handed back to the caller, plus the switch the call caused.
#[derive(Debug)]
pub struct SyscallReturn {
    pub value: usize,
    pub switch: Option<ContextSwitch>,
}

impl SyscallReturn {
    fn with_value(value: usize) -> Self {
        SyscallReturn {
            value,
            switch: None,
        }
    }

    fn failure(err: SyscallError) -> Self {
        log::warn!("Syscall rejected: {}", err);
        Self::with_value(SYSCALL_FAILURE)
    }
}

impl<C: Cpu> Kernel<C> {
    pub fn syscall(&mut self, call: Syscall<'_>, out: &mut impl ByteSink) -> SyscallReturn {
        let _guard = InterruptGuard::<C>::new();
        match call {
            Syscall::Exit { code } => sys_exit(self, code),
            Syscall::GetPid => sys_getpid(self),
            Syscall::Sleep { ms } => sys_sleep(self, ms),
            Syscall::Write { stream, buf } => sys_write(stream, buf, out),
        }
    }

    /// Decodes and runs a raw syscall. Anything undecodable returns the
    /// failure value without touching the caller.
    ///
    /// # Safety
    ///
    /// See [`Syscall::from_raw`].
    pub unsafe fn dispatch_syscall(
        &mut self,
        num: usize,
        args: [usize; 3],
        out: &mut impl ByteSink,
    ) -> SyscallReturn {
        match Syscall::from_raw(num, args) {
            Ok(call) => self.syscall(call, out),
            Err(e) => SyscallReturn::failure(e),
        }
    }
}

fn sys_exit<C: Cpu>(kernel: &mut Kernel<C>, code: i32) -> SyscallReturn {
    SyscallReturn {
        value: 0,
        switch: kernel.exit(code),
    }
}

fn sys_getpid<C: Cpu>(kernel: &Kernel<C>) -> SyscallReturn {
    SyscallReturn::with_value(kernel.current_pid().map_or(0, |pid| pid.as_u32() as usize))
}

fn sys_sleep<C: Cpu>(kernel: &mut Kernel<C>, ms: u32) -> SyscallReturn {
    SyscallReturn {
        value: 0,
        switch: kernel.sleep(ms),
    }
}

fn sys_write(stream: usize, buf: &[u8], out: &mut impl ByteSink) -> SyscallReturn {
    if stream != STDOUT {
        return SyscallReturn::failure(SyscallError::BadStream(stream));
    }
    out.write_bytes(buf);
    SyscallReturn::with_value(buf.len())
}
