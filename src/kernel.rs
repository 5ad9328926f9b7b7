//! The kernel context object.
//!
//! Owns the frame bitmap, kernel heap, address spaces, process table and
//! scheduler. Every public operation masks interrupts for its whole
//! duration, so a timer tick can never observe a half-updated structure.
//! Scheduling operations hand back a [`ContextSwitch`] for the caller to
//! perform once it has released whatever lock guards the kernel.

use core::{fmt, marker::PhantomData};

use crate::{
    arch::{ContextSwitch, Cpu, InterruptGuard},
    constants::{
        memory::{FRAME_SIZE, KERNEL_HEAP_END, KERNEL_HEAP_START, RESERVED_END},
        processes::{IDLE_PRIORITY, PROCESS_HEAP_SIZE},
    },
    memory::{
        bitmap_frame_allocator::BitmapFrameAllocator,
        frame_allocator::FrameError,
        heap::{HeapError, KernelHeap},
        paging::{AddressSpaceManager, MapError},
        Directory, MemoryStats, PageFlags, PhysAddr, PhysFrame, PhysOffset, VirtAddr,
    },
    processes::{
        process::{Pcb, Pid, ProcessInfo, ProcessResources},
        scheduler::{Scheduler, SchedulerConfig},
        table::{ProcessError, ProcessTable},
        write_process_list,
    },
};

/// Memory sizes reported by the boot loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootInfo {
    pub mem_lower_kb: u32,
    pub mem_upper_kb: u32,
}

impl BootInfo {
    pub fn total_bytes(&self) -> usize {
        (self.mem_lower_kb as usize + self.mem_upper_kb as usize) * 1024
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    Frame(FrameError),
    Heap(HeapError),
    Map(MapError),
    Process(ProcessError),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::Frame(e) => write!(f, "Frame allocator: {}", e),
            KernelError::Heap(e) => write!(f, "Kernel heap: {}", e),
            KernelError::Map(e) => write!(f, "Paging: {}", e),
            KernelError::Process(e) => write!(f, "Process table: {}", e),
        }
    }
}

impl From<FrameError> for KernelError {
    fn from(e: FrameError) -> Self {
        KernelError::Frame(e)
    }
}

impl From<HeapError> for KernelError {
    fn from(e: HeapError) -> Self {
        KernelError::Heap(e)
    }
}

impl From<MapError> for KernelError {
    fn from(e: MapError) -> Self {
        KernelError::Map(e)
    }
}

impl From<ProcessError> for KernelError {
    fn from(e: ProcessError) -> Self {
        KernelError::Process(e)
    }
}

pub struct Kernel<C: Cpu> {
    pub(crate) frames: BitmapFrameAllocator,
    pub(crate) heap: KernelHeap,
    pub(crate) paging: AddressSpaceManager,
    pub(crate) processes: ProcessTable,
    pub(crate) scheduler: Scheduler,
    idle: Pid,
    _cpu: PhantomData<C>,
}

impl<C: Cpu> Kernel<C> {
    /// A kernel owning no memory and no processes. Const so the boot image
    /// can keep it in a `static` and bring it up with [`init`](Self::init)
    /// without the bitmap ever passing through the stack.
    pub const fn new() -> Self {
        Kernel {
            frames: BitmapFrameAllocator::empty(),
            heap: KernelHeap::empty(),
            paging: AddressSpaceManager::new(PhysOffset::identity()),
            processes: ProcessTable::new(SchedulerConfig::DEFAULT.time_slice_ticks),
            scheduler: Scheduler::new(SchedulerConfig::DEFAULT),
            idle: Pid::new(0),
            _cpu: PhantomData,
        }
    }

    /// Brings up memory management and creates the idle process. Meant to
    /// run once, on a kernel fresh from [`new`](Self::new).
    ///
    /// All installed memory is identity-mapped kernel-only in the kernel
    /// directory, which is loaded before paging is switched on. `idle_entry`
    /// runs whenever nothing else is ready.
    pub fn init(
        &mut self,
        boot: BootInfo,
        phys: PhysOffset,
        idle_entry: u32,
        config: SchedulerConfig,
    ) -> Result<(), KernelError> {
        let _guard = InterruptGuard::<C>::new();
        log::info!(
            "Memory: {} KB lower, {} KB upper",
            boot.mem_lower_kb,
            boot.mem_upper_kb
        );

        self.frames.reset(boot.total_bytes(), RESERVED_END)?;
        self.heap.reset(KERNEL_HEAP_START, KERNEL_HEAP_END)?;

        self.paging = AddressSpaceManager::new(phys);
        let mapped_end = (self.frames.total_frames() * FRAME_SIZE) as u32;
        let kernel_directory = self
            .paging
            .init_kernel_directory::<C>(mapped_end, &mut self.frames)?;
        self.paging.switch_to::<C>(kernel_directory);
        // SAFETY: the kernel directory identity-maps everything we run on
        unsafe { C::enable_paging() };
        log::info!("Paging enabled");

        self.processes.reset(config.time_slice_ticks);
        self.scheduler = Scheduler::new(config);
        self.idle = self.processes.create(
            "idle",
            idle_entry,
            IDLE_PRIORITY,
            ProcessResources {
                directory: Some(kernel_directory),
                ..ProcessResources::default()
            },
        )?;
        self.seed_stack(self.idle);
        Ok(())
    }

    fn seed_stack(&self, pid: Pid) {
        if let Some(pcb) = self.processes.get_by_pid(pid) {
            // SAFETY: stack slots lie in the reserved, identity-mapped window
            unsafe { C::prepare_stack(&pcb.context) };
        }
    }

    /// Creates a process with its own directory and heap region. On failure
    /// nothing stays allocated.
    pub fn spawn(&mut self, name: &str, entry: u32, priority: u32) -> Result<Pid, KernelError> {
        let _guard = InterruptGuard::<C>::new();
        if self.processes.is_full() {
            log::warn!("Cannot create '{}': process table full", name);
            return Err(ProcessError::TableFull.into());
        }

        let heap_start = self.heap.allocate(PROCESS_HEAP_SIZE)?;
        let directory = match self.paging.create_process_directory(&mut self.frames) {
            Ok(directory) => directory,
            Err(e) => {
                self.release_heap(heap_start);
                return Err(e.into());
            }
        };

        let resources = ProcessResources {
            directory: Some(directory),
            heap_start,
            heap_end: heap_start + PROCESS_HEAP_SIZE,
        };
        let pid = match self.processes.create(name, entry, priority, resources) {
            Ok(pid) => pid,
            Err(e) => {
                self.release(&resources);
                return Err(e.into());
            }
        };

        self.seed_stack(pid);
        Ok(pid)
    }

    fn release(&mut self, resources: &ProcessResources) {
        if let Some(directory) = resources.directory {
            if Some(directory) != self.paging.kernel_directory() {
                if let Err(e) = self.paging.destroy_directory(directory, &mut self.frames) {
                    log::warn!("Leaking address space {:?}: {}", directory, e);
                }
            }
        }
        if resources.heap_end > resources.heap_start {
            self.release_heap(resources.heap_start);
        }
    }

    fn release_heap(&mut self, address: u32) {
        if let Err(e) = self.heap.free(address) {
            log::warn!("Leaking process heap at {:#x}: {}", address, e);
        }
    }

    fn resources_of(pcb: &Pcb) -> ProcessResources {
        ProcessResources {
            directory: pcb.directory,
            heap_start: pcb.heap_start,
            heap_end: pcb.heap_end,
        }
    }

    /// Keeps the address space bookkeeping in line with the directory a
    /// planned switch is about to load.
    fn track(&mut self, switch: Option<ContextSwitch>) -> Option<ContextSwitch> {
        if let Some(frame) = switch.as_ref().and_then(ContextSwitch::directory) {
            self.paging.record_loaded(frame);
        }
        switch
    }

    /// Dispatches the first process. The boot context is not saved.
    pub fn start(&mut self) -> Option<ContextSwitch> {
        let _guard = InterruptGuard::<C>::new();
        let switch = self.scheduler.schedule(&mut self.processes);
        self.track(switch)
    }

    /// Terminates the current process, frees its heap region and address
    /// space, and picks a successor.
    pub fn exit(&mut self, exit_code: i32) -> Option<ContextSwitch> {
        let _guard = InterruptGuard::<C>::new();
        if self.processes.current_pid() == Some(self.idle) {
            log::warn!("Ignoring exit from the idle process");
            return None;
        }

        let pcb = self.processes.exit(exit_code)?;
        // the directory frame stays intact until the next load replaces it
        self.release(&Self::resources_of(&pcb));
        let switch = self.scheduler.schedule(&mut self.processes);
        self.track(switch)
    }

    /// Timer interrupt entry.
    pub fn tick(&mut self) -> Option<ContextSwitch> {
        let _guard = InterruptGuard::<C>::new();
        let switch = self.scheduler.tick(&mut self.processes);
        self.track(switch)
    }

    pub fn yield_now(&mut self) -> Option<ContextSwitch> {
        let _guard = InterruptGuard::<C>::new();
        let switch = self.scheduler.yield_now(&mut self.processes);
        self.track(switch)
    }

    pub fn sleep(&mut self, ms: u32) -> Option<ContextSwitch> {
        let _guard = InterruptGuard::<C>::new();
        let switch = self.scheduler.sleep(&mut self.processes, ms);
        self.track(switch)
    }

    pub fn current_pid(&self) -> Option<Pid> {
        self.processes.current_pid()
    }

    pub fn idle_pid(&self) -> Pid {
        self.idle
    }

    pub fn process(&self, pid: Pid) -> Option<&Pcb> {
        self.processes.get_by_pid(pid)
    }

    pub fn processes(&self) -> impl Iterator<Item = ProcessInfo> + '_ {
        self.processes.infos()
    }

    pub fn write_process_list<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        write_process_list(out, self.processes.infos())
    }

    pub fn uptime_ticks(&self) -> u64 {
        self.scheduler.uptime_ticks()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.scheduler.uptime_secs()
    }

    pub fn allocate_frame(&mut self) -> Option<PhysFrame> {
        let _guard = InterruptGuard::<C>::new();
        self.frames.allocate()
    }

    pub fn free_frame(&mut self, frame: PhysFrame) -> Result<(), FrameError> {
        let _guard = InterruptGuard::<C>::new();
        self.frames.free(frame)
    }

    pub fn kmalloc(&mut self, size: u32) -> Result<u32, HeapError> {
        let _guard = InterruptGuard::<C>::new();
        self.heap.allocate(size)
    }

    pub fn kfree(&mut self, address: u32) -> Result<(), HeapError> {
        let _guard = InterruptGuard::<C>::new();
        self.heap.free(address)
    }

    pub fn create_directory(&mut self) -> Result<Directory, MapError> {
        let _guard = InterruptGuard::<C>::new();
        self.paging.create_process_directory(&mut self.frames)
    }

    pub fn switch_address_space(&mut self, directory: Directory) {
        let _guard = InterruptGuard::<C>::new();
        self.paging.switch_to::<C>(directory);
    }

    pub fn current_directory(&self) -> Option<Directory> {
        self.paging.current()
    }

    /// Maps into the active address space.
    pub fn map(&mut self, virt: VirtAddr, phys: PhysAddr, flags: PageFlags) -> Result<(), MapError> {
        let _guard = InterruptGuard::<C>::new();
        self.paging.map::<C>(virt, phys, flags, &mut self.frames)
    }

    pub fn unmap(&mut self, virt: VirtAddr) -> Result<PhysFrame, MapError> {
        let _guard = InterruptGuard::<C>::new();
        self.paging.unmap::<C>(virt, &mut self.frames)
    }

    pub fn translate(&self, virt: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
        self.paging.translate(virt)
    }

    pub fn memory_stats(&self) -> MemoryStats {
        let total_pages = self.frames.total_frames();
        let free_pages = self.frames.free_frames();
        MemoryStats {
            total_bytes: total_pages * FRAME_SIZE,
            used_bytes: (total_pages - free_pages) * FRAME_SIZE,
            free_bytes: free_pages * FRAME_SIZE,
            total_pages,
            free_pages,
            heap_used_bytes: self.heap.used_bytes() as usize,
            heap_free_bytes: self.heap.free_bytes() as usize,
        }
    }

    pub fn write_memory_info<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        writeln!(out, "{}", self.memory_stats())
    }
}

impl<C: Cpu> Default for Kernel<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arch::mock::{self, CpuEvent, MockCpu},
        constants::processes::MAX_PROCESSES,
        memory::test_support::PhysBacking,
        processes::process::ProcessState,
    };
    use std::{string::String, vec::Vec};

    const MIB: u32 = 1024 * 1024;
    const IDLE_ENTRY: u32 = 0x0010_0400;
    const BOOT: BootInfo = BootInfo {
        mem_lower_kb: 0,
        mem_upper_kb: 16 * 1024,
    };
    const CONFIG: SchedulerConfig = SchedulerConfig {
        time_slice_ticks: 2,
        timer_frequency: 1000,
    };

    fn boot() -> (PhysBacking, Kernel<MockCpu>) {
        mock::reset(true);
        let backing = PhysBacking::new(RESERVED_END, 16 * MIB);
        let mut kernel = Kernel::<MockCpu>::new();
        kernel.init(BOOT, backing.offset(), IDLE_ENTRY, CONFIG).unwrap();
        (backing, kernel)
    }

    #[test]
    fn test_init_maps_memory_and_creates_idle() {
        let (_backing, kernel) = boot();
        let events = mock::events();
        assert!(events.contains(&CpuEvent::EnablePaging));
        assert!(events
            .iter()
            .any(|e| matches!(e, CpuEvent::LoadDirectory(_))));
        assert!(MockCpu::interrupts_enabled());

        let sample = VirtAddr::new(0x00B8_0123);
        assert_eq!(
            kernel.translate(sample),
            Some((
                PhysAddr::new(0x00B8_0123),
                PageFlags::PRESENT | PageFlags::WRITABLE
            ))
        );

        let idle = kernel.process(kernel.idle_pid()).unwrap();
        assert_eq!(idle.priority, IDLE_PRIORITY);
        assert_eq!(idle.context.eip, IDLE_ENTRY);
        assert_eq!(kernel.processes().count(), 1);
    }

    #[test]
    fn test_init_rejects_tiny_memory() {
        mock::reset(true);
        let backing = PhysBacking::new(RESERVED_END, RESERVED_END + 4096);
        let mut kernel = Kernel::<MockCpu>::new();
        let result = kernel.init(
            BootInfo {
                mem_lower_kb: 0,
                mem_upper_kb: RESERVED_END / 1024,
            },
            backing.offset(),
            IDLE_ENTRY,
            SchedulerConfig::default(),
        );
        assert_eq!(
            result,
            Err(KernelError::Frame(FrameError::InsufficientMemory))
        );
        assert_eq!(kernel.processes().count(), 0);
    }

    static SLOT: spin::Mutex<Kernel<MockCpu>> = spin::Mutex::new(Kernel::new());

    #[test]
    fn test_init_in_place_inside_static() {
        mock::reset(true);
        let backing = PhysBacking::new(RESERVED_END, 16 * MIB);
        let mut kernel = SLOT.lock();

        // nothing to do before bring-up
        assert!(kernel.start().is_none());
        assert!(kernel.allocate_frame().is_none());
        assert_eq!(
            kernel.map(VirtAddr::new(0), PhysAddr::new(0), PageFlags::PRESENT),
            Err(MapError::NoActiveDirectory)
        );

        kernel.init(BOOT, backing.offset(), IDLE_ENTRY, CONFIG).unwrap();
        assert_eq!(kernel.processes().count(), 1);
        let pid = kernel.spawn("resident", 0x0010_8000, 3).unwrap();
        assert_eq!(kernel.start().map(|s| s.to), Some(pid));
        assert_eq!(kernel.exit(0).map(|s| s.to), Some(kernel.idle_pid()));
    }

    #[test]
    fn test_spawn_allocates_and_exit_releases() {
        let (_backing, mut kernel) = boot();
        let before = kernel.memory_stats();

        let pid = kernel.spawn("worker", 0x0010_8000, 5).unwrap();
        let pcb = *kernel.process(pid).unwrap();
        assert_eq!(pcb.heap_end - pcb.heap_start, PROCESS_HEAP_SIZE);
        assert!(pcb.directory.is_some());
        assert_ne!(pcb.directory, kernel.current_directory());
        assert_eq!(kernel.memory_stats().free_pages, before.free_pages - 1);
        assert_eq!(
            kernel.memory_stats().heap_used_bytes,
            PROCESS_HEAP_SIZE as usize
        );

        let switch = kernel.start().unwrap();
        assert_eq!(switch.to, pid);
        assert_eq!(switch.directory(), pcb.directory.map(|d| d.frame()));
        assert_eq!(kernel.current_directory(), pcb.directory);
        unsafe { switch.perform::<MockCpu>() };

        let switch = kernel.exit(0).unwrap();
        assert_eq!(switch.from, None);
        assert_eq!(switch.to, kernel.idle_pid());
        assert!(kernel.process(pid).is_none());
        assert_eq!(kernel.memory_stats(), before);
        assert_eq!(kernel.current_directory(), kernel.paging.kernel_directory());
    }

    #[test]
    fn test_spawn_fails_when_table_full() {
        let (_backing, mut kernel) = boot();
        for i in 0..MAX_PROCESSES - 1 {
            kernel
                .spawn(&format!("p{i}"), 0x0010_8000, 1)
                .unwrap();
        }
        let stats = kernel.memory_stats();
        assert_eq!(
            kernel.spawn("one-too-many", 0x0010_8000, 1),
            Err(KernelError::Process(ProcessError::TableFull))
        );
        assert_eq!(kernel.memory_stats(), stats);
        assert_eq!(kernel.processes().count(), MAX_PROCESSES);
    }

    #[test]
    fn test_spawn_rolls_back_heap_when_frames_run_out() {
        let (_backing, mut kernel) = boot();
        while kernel.allocate_frame().is_some() {}
        let heap_used = kernel.memory_stats().heap_used_bytes;

        assert_eq!(
            kernel.spawn("starved", 0x0010_8000, 1),
            Err(KernelError::Map(MapError::FrameAllocationFailed))
        );
        assert_eq!(kernel.memory_stats().heap_used_bytes, heap_used);
        assert_eq!(kernel.processes().count(), 1);
    }

    #[test]
    fn test_operations_mask_interrupts() {
        let (_backing, mut kernel) = boot();
        mock::clear_events();
        kernel.kmalloc(64).unwrap();
        assert_eq!(
            mock::events(),
            [CpuEvent::DisableInterrupts, CpuEvent::EnableInterrupts]
        );

        // already masked, e.g. inside the timer handler: left masked
        mock::reset(false);
        let _ = kernel.tick();
        assert!(!MockCpu::interrupts_enabled());
        assert!(!mock::events().contains(&CpuEvent::EnableInterrupts));
    }

    #[test]
    fn test_preemption_by_tick() {
        let (_backing, mut kernel) = boot();
        let low = kernel.spawn("low", 0x0010_8000, 1).unwrap();
        let _ = kernel.start();
        assert_eq!(kernel.current_pid(), Some(low));

        let high = kernel.spawn("high", 0x0010_9000, 9).unwrap();
        assert!(kernel.tick().is_none());
        let switch = kernel.tick().unwrap();
        assert_eq!(switch.from, Some(low));
        assert_eq!(switch.to, high);
        assert_eq!(kernel.process(low).unwrap().state, ProcessState::Ready);
        assert_eq!(kernel.process(low).unwrap().total_ticks, 2);

        mock::clear_events();
        unsafe { switch.perform::<MockCpu>() };
        assert_eq!(
            mock::switches(),
            [CpuEvent::Switch {
                saved: true,
                eip: 0x0010_9000,
                esp: kernel.process(high).unwrap().stack_top - 4,
            }]
        );
    }

    #[test]
    fn test_idle_cannot_exit() {
        let (_backing, mut kernel) = boot();
        let _ = kernel.start();
        assert_eq!(kernel.current_pid(), Some(kernel.idle_pid()));
        assert!(kernel.exit(0).is_none());
        assert_eq!(kernel.current_pid(), Some(kernel.idle_pid()));
    }

    #[test]
    fn test_sleep_runs_idle_then_resumes() {
        let (_backing, mut kernel) = boot();
        let pid = kernel.spawn("napper", 0x0010_8000, 3).unwrap();
        let _ = kernel.start();

        let switch = kernel.sleep(3).unwrap();
        assert_eq!(switch.to, kernel.idle_pid());
        assert_eq!(kernel.process(pid).unwrap().state, ProcessState::Blocked);

        let resumed = (0..4).filter_map(|_| kernel.tick()).last().unwrap();
        assert_eq!(resumed.to, pid);
        assert_eq!(kernel.uptime_ticks(), 4);
    }

    #[test]
    fn test_memory_info_report() {
        let (_backing, kernel) = boot();
        let stats = kernel.memory_stats();
        assert_eq!(stats.total_pages, 4096);
        assert_eq!(stats.total_bytes, 16 * MIB as usize);
        assert_eq!(stats.used_pages() + stats.free_pages, stats.total_pages);

        let mut out = String::new();
        kernel.write_memory_info(&mut out).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "Memory Information:");
        assert_eq!(lines[2], "Total memory: 16384 KB");
        assert_eq!(lines[5], "Total pages:  4096");
    }

    #[test]
    fn test_process_list_includes_idle() {
        let (_backing, mut kernel) = boot();
        kernel.spawn("shell", 0x0010_8000, 5).unwrap();
        let mut out = String::new();
        kernel.write_process_list(&mut out).unwrap();
        assert!(out.contains("idle"));
        assert!(out.lines().any(|l| l.starts_with("2    shell")));
    }
}
