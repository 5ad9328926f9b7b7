use core::fmt;

use arrayvec::ArrayString;

use crate::{
    arch::Context,
    constants::{
        memory::PROCESS_STACKS_START,
        processes::{INITIAL_EFLAGS, MAX_NAME_LEN, STACK_SIZE, STACK_SLOTS},
    },
    memory::Directory,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u32);

impl Pid {
    pub const fn new(pid: u32) -> Self {
        Pid(pid)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    Blocked,
    Terminated,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Ready => "READY",
            ProcessState::Running => "RUNNING",
            ProcessState::Blocked => "BLOCKED",
            ProcessState::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Address space and heap handed to a process at creation. Both are owned
/// by the caller that allocated them and must be released on exit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessResources {
    pub directory: Option<Directory>,
    pub heap_start: u32,
    pub heap_end: u32,
}

/// Process control block
#[derive(Debug, Clone, Copy)]
pub struct Pcb {
    pub pid: Pid,
    pub name: ArrayString<MAX_NAME_LEN>,
    pub state: ProcessState,
    pub context: Context,
    pub directory: Option<Directory>,
    pub stack_base: u32,
    pub stack_top: u32,
    pub heap_start: u32,
    pub heap_end: u32,
    pub priority: u32,
    pub time_slice: u32,
    pub total_ticks: u64,
    /// Tick at which a sleeping process becomes ready again.
    pub wake_at: Option<u64>,
    pub(crate) next: Option<usize>,
}

impl Pcb {
    pub const EMPTY: Pcb = Pcb {
        pid: Pid(0),
        name: ArrayString::new_const(),
        state: ProcessState::Terminated,
        context: Context::empty(),
        directory: None,
        stack_base: 0,
        stack_top: 0,
        heap_start: 0,
        heap_end: 0,
        priority: 0,
        time_slice: 0,
        total_ticks: 0,
        wake_at: None,
        next: None,
    };

    /// Fresh PCB in state `Ready` whose context starts executing `entry`
    /// on top of its own stack slot.
    pub fn new(
        pid: Pid,
        name: &str,
        entry: u32,
        priority: u32,
        time_slice: u32,
        resources: ProcessResources,
    ) -> Self {
        let (stack_base, stack_top) = stack_region(pid);
        // one slot below the top holds the return address
        let esp = stack_top - 4;

        Pcb {
            pid,
            name: truncated_name(name),
            state: ProcessState::Ready,
            context: Context {
                esp,
                ebp: esp,
                eip: entry,
                eflags: INITIAL_EFLAGS,
                ..Context::empty()
            },
            directory: resources.directory,
            stack_base,
            stack_top,
            heap_start: resources.heap_start,
            heap_end: resources.heap_end,
            priority,
            time_slice,
            total_ticks: 0,
            wake_at: None,
            next: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.state != ProcessState::Terminated
    }

    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            pid: self.pid,
            name: self.name,
            state: self.state,
            priority: self.priority,
            total_ticks: self.total_ticks,
        }
    }
}

/// Stacks are carved from a fixed window by pid, not from the frame
/// allocator. Slots are reused once pids wrap past `STACK_SLOTS`.
pub fn stack_region(pid: Pid) -> (u32, u32) {
    let slot = pid.0 % STACK_SLOTS;
    let base = PROCESS_STACKS_START + slot * STACK_SIZE;
    (base, base + STACK_SIZE)
}

/// Copies as many whole characters as fit.
fn truncated_name(name: &str) -> ArrayString<MAX_NAME_LEN> {
    let mut out = ArrayString::new();
    for c in name.chars() {
        if out.try_push(c).is_err() {
            break;
        }
    }
    out
}

/// Read-only snapshot for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub name: ArrayString<MAX_NAME_LEN>,
    pub state: ProcessState,
    pub priority: u32,
    pub total_ticks: u64,
}
