//! Priority scheduler driven by the timer tick.
//!
//! Every method only updates bookkeeping and returns the register switch
//! it decided on, if any. The caller performs it once the kernel state is
//! no longer borrowed.

use crate::{
    arch::ContextSwitch,
    constants::{processes::DEFAULT_TIME_SLICE, timer::TIMER_FREQUENCY},
};

use super::{process::ProcessState, table::ProcessTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Ticks a process may run before it is preempted.
    pub time_slice_ticks: u32,
    /// Timer interrupts per second.
    pub timer_frequency: u32,
}

impl SchedulerConfig {
    pub const DEFAULT: SchedulerConfig = SchedulerConfig {
        time_slice_ticks: DEFAULT_TIME_SLICE,
        timer_frequency: TIMER_FREQUENCY,
    };
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    ticks: u64,
}

impl Scheduler {
    pub const fn new(config: SchedulerConfig) -> Self {
        Scheduler { config, ticks: 0 }
    }

    pub fn uptime_ticks(&self) -> u64 {
        self.ticks
    }

    pub fn uptime_secs(&self) -> u64 {
        self.ticks / u64::from(self.config.timer_frequency.max(1))
    }

    /// Whole ticks covering `ms`, rounded up.
    pub fn ms_to_ticks(&self, ms: u32) -> u64 {
        (u64::from(ms) * u64::from(self.config.timer_frequency)).div_ceil(1000)
    }

    /// Called once per timer interrupt.
    pub fn tick(&mut self, table: &mut ProcessTable) -> Option<ContextSwitch> {
        self.ticks += 1;
        table.wake_sleepers(self.ticks);

        let time_slice = self.config.time_slice_ticks;
        let current = table.current_mut()?;
        current.total_ticks += 1;
        current.time_slice = current.time_slice.saturating_sub(1);

        if current.time_slice > 0 {
            return None;
        }
        current.time_slice = time_slice;
        if current.state == ProcessState::Running {
            current.state = ProcessState::Ready;
        }
        self.schedule(table)
    }

    /// Picks the ready process with the highest priority. Among equal
    /// priorities the one queued last wins.
    pub fn schedule(&mut self, table: &mut ProcessTable) -> Option<ContextSwitch> {
        let mut selected: Option<usize> = None;
        for slot in table.queue() {
            let candidate = table.slot(slot);
            if candidate.state != ProcessState::Ready {
                continue;
            }
            match selected {
                Some(best) if table.slot(best).priority > candidate.priority => {}
                _ => selected = Some(slot),
            }
        }

        let current = table.current_slot();
        let Some(next) = selected else {
            log::debug!("No ready process to schedule");
            return None;
        };

        if current == Some(next) {
            table.slot_mut(next).state = ProcessState::Running;
            return None;
        }

        let from = current.map(|prev| {
            let pcb = table.slot_mut(prev);
            if pcb.state == ProcessState::Running {
                pcb.state = ProcessState::Ready;
            }
            (pcb.pid, table.context_ptr(prev))
        });

        let incoming = table.slot_mut(next);
        incoming.state = ProcessState::Running;
        incoming.time_slice = self.config.time_slice_ticks;
        let (to_pid, directory) = (incoming.pid, incoming.directory.map(|d| d.frame()));

        table.set_current_slot(next);
        log::debug!(
            "Switching {:?} -> {} at tick {}",
            from.map(|(pid, _)| pid),
            to_pid,
            self.ticks
        );

        Some(ContextSwitch::new(
            from,
            (to_pid, table.context_ptr(next)),
            directory,
        ))
    }

    /// Gives up the rest of the current slice.
    pub fn yield_now(&mut self, table: &mut ProcessTable) -> Option<ContextSwitch> {
        if let Some(current) = table.current_mut() {
            if current.state == ProcessState::Running {
                current.state = ProcessState::Ready;
            }
        }
        self.schedule(table)
    }

    /// Blocks the current process for at least `ms` milliseconds.
    pub fn sleep(&mut self, table: &mut ProcessTable, ms: u32) -> Option<ContextSwitch> {
        let ticks = self.ms_to_ticks(ms);
        if ticks == 0 {
            return self.yield_now(table);
        }

        let wake_at = self.ticks + ticks;
        let current = table.current_mut()?;
        current.state = ProcessState::Blocked;
        current.wake_at = Some(wake_at);
        log::debug!("Process {} sleeping until tick {}", current.pid, wake_at);
        self.schedule(table)
    }
}
