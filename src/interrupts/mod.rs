//! Entry points for the interrupt and syscall layer.
//!
//! IDT and PIC setup live outside the core. Their handlers call in here
//! with interrupts masked (interrupt gates) after acknowledging the PIC.
//! Every path masks interrupts before taking the kernel lock and performs
//! the resulting context switch only after releasing it.

use crate::{
    arch::{i686::I686, without_interrupts, ContextSwitch},
    devices::serial::SerialSink,
    init::KERNEL,
    kernel::Kernel,
};

/// Runs `f` on the global kernel. The lock is dropped before returning.
fn with_kernel<R>(f: impl FnOnce(&mut Kernel<I686>) -> R) -> R {
    f(&mut KERNEL.lock())
}

fn perform(switch: Option<ContextSwitch>) {
    if let Some(switch) = switch {
        // SAFETY: the kernel lock is released, interrupts are masked and the
        // table lives in a static, so the context pointers are stable
        unsafe { switch.perform::<I686>() };
    }
}

/// Periodic timer tick.
pub fn timer_tick() {
    without_interrupts::<I686, _, _>(|| perform(with_kernel(Kernel::tick)));
}

/// Syscall gate: number plus three word arguments, result in the return
/// value. Only returns to the caller once it is scheduled again.
pub fn syscall_entry(num: usize, arg1: usize, arg2: usize, arg3: usize) -> usize {
    without_interrupts::<I686, _, _>(|| {
        let ret = with_kernel(|kernel| unsafe {
            kernel.dispatch_syscall(num, [arg1, arg2, arg3], &mut SerialSink)
        });
        perform(ret.switch);
        ret.value
    })
}

/// Terminates the running process. Does not come back unless there was
/// nothing to terminate.
pub fn exit_current(code: i32) {
    without_interrupts::<I686, _, _>(|| perform(with_kernel(|k| k.exit(code))));
}

pub fn yield_now() {
    without_interrupts::<I686, _, _>(|| perform(with_kernel(Kernel::yield_now)));
}
