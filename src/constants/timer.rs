//! Timer configuration constants.

/// Tick source frequency in Hertz (1 ms per tick).
pub const TIMER_FREQUENCY: u32 = 1000;
