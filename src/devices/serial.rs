//! Serial port interface for UART 16550 communication.
//! Provides locked access to write formatted text to COM1.

use crate::constants::ports::SERIAL_PORT;
use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

use super::ByteSink;

lazy_static! {
    /// First serial port (COM1), initialized on first access.
    pub static ref SERIAL1: Mutex<SerialPort> = {
        let mut serial_port = unsafe { SerialPort::new(SERIAL_PORT) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

impl ByteSink for SerialPort {
    fn write_byte(&mut self, byte: u8) {
        self.send(byte);
    }
}

/// Syscall output routed to COM1. Locks the port per call so logging from
/// inside the kernel never finds it held.
pub struct SerialSink;

impl ByteSink for SerialSink {
    fn write_byte(&mut self, byte: u8) {
        SERIAL1.lock().write_byte(byte);
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        SERIAL1.lock().write_bytes(bytes);
    }
}

#[doc(hidden)]
pub fn _print(args: ::core::fmt::Arguments) {
    // a broken serial line has nowhere else to report to
    #[cfg(target_arch = "x86")]
    let _ = super::print_masked::<crate::arch::i686::I686, _>(&*SERIAL1, args);
    #[cfg(not(target_arch = "x86"))]
    let _ = ::core::fmt::Write::write_fmt(&mut *SERIAL1.lock(), args);
}

/// Prints formatted text to the serial port.
///
/// # Examples
/// ```ignore
/// serial_print!("Hello {}", "World");
/// ```
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::devices::serial::_print(format_args!($($arg)*))
    };
}

/// Prints formatted text to the serial port, followed by a newline.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}
