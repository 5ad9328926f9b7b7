//! Device access used by the kernel core.
//!
//! Only the serial port is driven here. Display and keyboard drivers live
//! outside the core and plug in through [`ByteSink`].

use core::fmt;

use spin::Mutex;

use crate::arch::{without_interrupts, Cpu};

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub mod serial;

/// Byte-oriented output, used for syscall writes and diagnostics.
pub trait ByteSink {
    fn write_byte(&mut self, byte: u8);

    fn write_bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.write_byte(byte);
        }
    }
}

/// Writes `args` to a console that interrupt handlers also print to. The
/// lock is only ever held with interrupts masked.
pub fn print_masked<C: Cpu, W: fmt::Write>(
    console: &Mutex<W>,
    args: fmt::Arguments,
) -> fmt::Result {
    without_interrupts::<C, _, _>(|| fmt::Write::write_fmt(&mut *console.lock(), args))
}

#[cfg(test)]
impl ByteSink for std::vec::Vec<u8> {
    fn write_byte(&mut self, byte: u8) {
        self.push(byte);
    }
}
