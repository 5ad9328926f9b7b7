#![cfg_attr(not(test), no_std)]
#![cfg_attr(feature = "strict", deny(warnings))]

use core::fmt;

pub mod arch;
pub mod constants;
pub mod devices;
#[cfg(target_arch = "x86")]
pub mod init;
#[cfg(target_arch = "x86")]
pub mod interrupts;
pub mod kernel;
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub mod logging;
pub mod memory;
pub mod processes;
pub mod syscalls;

use arch::Cpu;

/// Reports a condition the kernel cannot continue from and stops the CPU
/// with interrupts masked.
pub fn unrecoverable<C: Cpu>(args: fmt::Arguments) -> ! {
    C::disable_interrupts();
    log::error!("Unrecoverable: {}", args);
    loop {
        C::halt();
    }
}

pub fn idle_loop<C: Cpu>() -> ! {
    loop {
        C::halt();
    }
}
