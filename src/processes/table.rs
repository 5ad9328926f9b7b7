//! Fixed-capacity process table.
//!
//! Slots are reused once their process terminates. Live processes are
//! threaded onto the ready queue by slot index in creation order; the
//! scheduler filters the queue by state rather than the queue tracking
//! readiness itself.

use core::{fmt, ptr};

use crate::{arch::Context, constants::processes::MAX_PROCESSES};

use super::process::{Pcb, Pid, ProcessInfo, ProcessResources, ProcessState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    TableFull,
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::TableFull => write!(f, "Process table is full"),
        }
    }
}

pub struct ProcessTable {
    processes: [Pcb; MAX_PROCESSES],
    queue_head: Option<usize>,
    queue_tail: Option<usize>,
    current: Option<usize>,
    next_pid: u32,
    time_slice: u32,
}

impl ProcessTable {
    pub const fn new(time_slice: u32) -> Self {
        ProcessTable {
            processes: [Pcb::EMPTY; MAX_PROCESSES],
            queue_head: None,
            queue_tail: None,
            current: None,
            next_pid: 1,
            time_slice,
        }
    }

    /// Empties the table where it lives. Pids restart at 1.
    pub fn reset(&mut self, time_slice: u32) {
        self.processes.fill(Pcb::EMPTY);
        self.queue_head = None;
        self.queue_tail = None;
        self.current = None;
        self.next_pid = 1;
        self.time_slice = time_slice;
    }

    pub fn is_full(&self) -> bool {
        self.processes.iter().all(Pcb::is_live)
    }

    pub fn len(&self) -> usize {
        self.processes.iter().filter(|p| p.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a new `Ready` process in the first free slot. A full table
    /// is left untouched.
    pub fn create(
        &mut self,
        name: &str,
        entry_point: u32,
        priority: u32,
        resources: ProcessResources,
    ) -> Result<Pid, ProcessError> {
        let slot = self
            .processes
            .iter()
            .position(|p| !p.is_live())
            .ok_or(ProcessError::TableFull)?;

        let pid = self.allocate_pid();

        self.processes[slot] =
            Pcb::new(pid, name, entry_point, priority, self.time_slice, resources);
        self.enqueue(slot);

        log::info!("Created process '{}' (PID: {})", self.processes[slot].name, pid);
        Ok(pid)
    }

    /// Terminates the current process and returns its final PCB so the
    /// caller can release what it owned. No-op without a current process.
    pub fn exit(&mut self, exit_code: i32) -> Option<Pcb> {
        let slot = self.current.take()?;
        self.terminate_slot(slot);
        let pcb = self.processes[slot];
        log::info!(
            "Process '{}' (PID: {}) exiting with code {}",
            pcb.name,
            pcb.pid,
            exit_code
        );
        Some(pcb)
    }

    /// Next unused pid. The counter wraps past `u32::MAX` back to 1 and
    /// skips pids that are still live.
    fn allocate_pid(&mut self) -> Pid {
        loop {
            let pid = Pid::new(self.next_pid);
            self.next_pid = self.next_pid.wrapping_add(1).max(1);
            if self.slot_of(pid).is_none() {
                return pid;
            }
        }
    }

    fn terminate_slot(&mut self, slot: usize) {
        self.dequeue(slot);
        let pcb = &mut self.processes[slot];
        pcb.state = ProcessState::Terminated;
        pcb.wake_at = None;
    }

    pub fn get_by_pid(&self, pid: Pid) -> Option<&Pcb> {
        self.slot_of(pid).map(|slot| &self.processes[slot])
    }

    pub fn get_by_pid_mut(&mut self, pid: Pid) -> Option<&mut Pcb> {
        self.slot_of(pid).map(|slot| &mut self.processes[slot])
    }

    /// Live processes in slot order.
    pub fn list(&self) -> impl Iterator<Item = &Pcb> + '_ {
        self.processes.iter().filter(|p| p.is_live())
    }

    pub fn current(&self) -> Option<&Pcb> {
        self.current.map(|slot| &self.processes[slot])
    }

    pub fn current_mut(&mut self) -> Option<&mut Pcb> {
        self.current.map(|slot| &mut self.processes[slot])
    }

    pub fn current_pid(&self) -> Option<Pid> {
        self.current().map(|p| p.pid)
    }

    fn slot_of(&self, pid: Pid) -> Option<usize> {
        self.processes
            .iter()
            .position(|p| p.is_live() && p.pid == pid)
    }

    pub(crate) fn current_slot(&self) -> Option<usize> {
        self.current
    }

    pub(crate) fn set_current_slot(&mut self, slot: usize) {
        self.current = Some(slot);
    }

    pub(crate) fn slot(&self, slot: usize) -> &Pcb {
        &self.processes[slot]
    }

    pub(crate) fn slot_mut(&mut self, slot: usize) -> &mut Pcb {
        &mut self.processes[slot]
    }

    pub(crate) fn context_ptr(&mut self, slot: usize) -> *mut Context {
        ptr::addr_of_mut!(self.processes[slot].context)
    }

    /// Slot indices on the ready queue, head first.
    pub(crate) fn queue(&self) -> impl Iterator<Item = usize> + '_ {
        let mut cursor = self.queue_head;
        core::iter::from_fn(move || {
            let slot = cursor?;
            cursor = self.processes[slot].next;
            Some(slot)
        })
    }

    /// Makes blocked sleepers whose wake tick has passed ready again.
    pub(crate) fn wake_sleepers(&mut self, now: u64) {
        for pcb in self.processes.iter_mut() {
            if pcb.state == ProcessState::Blocked && pcb.wake_at.is_some_and(|t| t <= now) {
                pcb.state = ProcessState::Ready;
                pcb.wake_at = None;
                log::debug!("Woke process {} at tick {}", pcb.pid, now);
            }
        }
    }

    fn enqueue(&mut self, slot: usize) {
        self.processes[slot].next = None;
        match self.queue_tail {
            Some(tail) => self.processes[tail].next = Some(slot),
            None => self.queue_head = Some(slot),
        }
        self.queue_tail = Some(slot);
    }

    fn dequeue(&mut self, slot: usize) {
        let next = self.processes[slot].next.take();
        let prev = self.queue().find(|&s| self.processes[s].next == Some(slot));

        match prev {
            Some(prev) => self.processes[prev].next = next,
            None if self.queue_head == Some(slot) => self.queue_head = next,
            None => return,
        }
        if self.queue_tail == Some(slot) {
            self.queue_tail = prev;
        }
    }

    pub fn infos(&self) -> impl Iterator<Item = ProcessInfo> + '_ {
        self.list().map(Pcb::info)
    }
}
