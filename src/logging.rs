//! Kernel log sink
//!
//! Routes the `log` crate macros to COM1 as `[LEVEL] message` lines. A
//! record is a single masked write to the port, so records from a timer
//! tick land between lines, never inside one.

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

pub static LOGGER: Logger = Logger;

/// Stateless; serialisation is the serial port's lock.
pub struct Logger;

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            crate::serial_println!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Installs [`LOGGER`]. Debug builds log at `Debug`, release builds at `Info`.
pub fn init() -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(
        #[cfg(debug_assertions)]
        LevelFilter::Debug,
        #[cfg(not(debug_assertions))]
        LevelFilter::Info,
    );
    Ok(())
}
