//! Bring-up of the global kernel instance on the target.

use spin::Mutex;

use crate::{
    arch::{i686::I686, without_interrupts},
    idle_loop,
    kernel::{BootInfo, Kernel, KernelError},
    memory::PhysOffset,
    processes::scheduler::SchedulerConfig,
};

/// The one kernel, built in `.data` and brought up in place. Only touched
/// with interrupts masked.
pub static KERNEL: Mutex<Kernel<I686>> = Mutex::new(Kernel::new());

extern "C" fn idle_main() -> ! {
    idle_loop::<I686>()
}

/// Brings up [`KERNEL`] over identity-mapped physical memory.
pub fn init(boot: BootInfo) -> Result<(), KernelError> {
    without_interrupts::<I686, _, _>(|| {
        KERNEL.lock().init(
            boot,
            PhysOffset::identity(),
            idle_main as usize as u32,
            SchedulerConfig::default(),
        )
    })?;
    log::info!("Kernel initialized");
    Ok(())
}

/// Hands the CPU to the first process. The boot context is abandoned, so
/// this only returns when nothing could be scheduled.
pub fn start() {
    without_interrupts::<I686, _, _>(|| {
        let switch = KERNEL.lock().start();
        if let Some(switch) = switch {
            // SAFETY: lock released, interrupts masked, contexts live in a static
            unsafe { switch.perform::<I686>() };
        }
    });
}
