//! CPU seam
//!
//! Everything the core needs from the processor goes through [`Cpu`]:
//! - interrupt flag control and halting
//! - translation root and TLB maintenance
//! - register-level context switching

use core::marker::PhantomData;

use crate::{memory::addr::VirtAddr, memory::PhysFrame, processes::process::Pid};

#[cfg(target_arch = "x86")]
pub mod i686;

#[cfg(test)]
pub mod mock;

/// Processor operations. The CPU is a global resource, so none of these
/// take a receiver.
pub trait Cpu {
    fn interrupts_enabled() -> bool;
    fn disable_interrupts();
    fn enable_interrupts();

    /// Waits for the next interrupt.
    fn halt();

    /// # Safety
    ///
    /// `directory` must map the currently executing kernel code and stack.
    unsafe fn load_directory(directory: PhysFrame);

    /// # Safety
    ///
    /// A directory identity-mapping the kernel must already be loaded.
    unsafe fn enable_paging();

    fn invalidate_page(addr: VirtAddr);

    /// Writes the return address a fresh process falls into when its entry
    /// function returns.
    ///
    /// # Safety
    ///
    /// `context.esp` must point into a mapped, writable stack.
    unsafe fn prepare_stack(context: &Context);

    /// Saves the running register state into `prev` (when present) and
    /// resumes `next`. Returns only when `prev` is switched back in.
    ///
    /// # Safety
    ///
    /// Both pointers must be valid for the duration of the switch and
    /// interrupts must be masked.
    unsafe fn switch_context(prev: Option<*mut Context>, next: *const Context);
}

/// Saved machine state of a process. Field order is relied on by the
/// switch routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct Context {
    pub esp: u32,
    pub ebp: u32,
    pub eip: u32,
    pub ebx: u32,
    pub esi: u32,
    pub edi: u32,
    pub eflags: u32,
}

impl Context {
    pub const fn empty() -> Self {
        Context {
            esp: 0,
            ebp: 0,
            eip: 0,
            ebx: 0,
            esi: 0,
            edi: 0,
            eflags: 0,
        }
    }
}

/// The machine half of a scheduling decision.
#[derive(Debug)]
#[must_use = "the scheduler's decision only takes effect once performed"]
pub struct ContextSwitch {
    pub from: Option<Pid>,
    pub to: Pid,
    prev: Option<*mut Context>,
    next: *const Context,
    directory: Option<PhysFrame>,
}

impl ContextSwitch {
    pub(crate) fn new(
        from: Option<(Pid, *mut Context)>,
        to: (Pid, *const Context),
        directory: Option<PhysFrame>,
    ) -> Self {
        ContextSwitch {
            from: from.map(|(pid, _)| pid),
            to: to.0,
            prev: from.map(|(_, ctx)| ctx),
            next: to.1,
            directory,
        }
    }

    /// `None` keeps the active address space.
    pub fn directory(&self) -> Option<PhysFrame> {
        self.directory
    }

    /// Installs the incoming address space, then swaps registers.
    ///
    /// # Safety
    ///
    /// The process table the contexts live in must not have moved or been
    /// modified since the switch was planned, and interrupts must be masked.
    pub unsafe fn perform<C: Cpu>(self) {
        if let Some(directory) = self.directory {
            C::load_directory(directory);
        }
        C::switch_context(self.prev, self.next);
    }
}

/// Masks interrupts until dropped, then restores the previous state.
pub struct InterruptGuard<C: Cpu> {
    were_enabled: bool,
    _cpu: PhantomData<C>,
}

impl<C: Cpu> InterruptGuard<C> {
    pub fn new() -> Self {
        let were_enabled = C::interrupts_enabled();
        if were_enabled {
            C::disable_interrupts();
        }
        InterruptGuard {
            were_enabled,
            _cpu: PhantomData,
        }
    }
}

impl<C: Cpu> Default for InterruptGuard<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Cpu> Drop for InterruptGuard<C> {
    fn drop(&mut self) {
        if self.were_enabled {
            C::enable_interrupts();
        }
    }
}

/// Executes a closure with interrupts disabled.
///
/// # Returns
/// Returns the result of the closure
pub fn without_interrupts<C: Cpu, F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = InterruptGuard::<C>::new();
    f()
}

#[cfg(test)]
mod tests {
    use super::{
        mock::{self, CpuEvent, MockCpu},
        *,
    };

    #[test]
    fn test_guard_restores_enabled_state() {
        mock::reset(true);
        {
            let _guard = InterruptGuard::<MockCpu>::new();
            assert!(!MockCpu::interrupts_enabled());
        }
        assert!(MockCpu::interrupts_enabled());
    }

    #[test]
    fn test_nested_guard_keeps_outer_mask() {
        mock::reset(true);
        let outer = InterruptGuard::<MockCpu>::new();
        {
            let _inner = InterruptGuard::<MockCpu>::new();
        }
        assert!(!MockCpu::interrupts_enabled());
        drop(outer);
        assert!(MockCpu::interrupts_enabled());
    }

    #[test]
    fn test_without_interrupts_early_return() {
        mock::reset(true);
        let bail = true;
        let result = without_interrupts::<MockCpu, _, _>(|| -> Result<(), ()> {
            assert!(!MockCpu::interrupts_enabled());
            if bail {
                return Err(());
            }
            Ok(())
        });
        assert!(result.is_err());
        assert!(MockCpu::interrupts_enabled());
        assert_eq!(
            mock::events(),
            [CpuEvent::DisableInterrupts, CpuEvent::EnableInterrupts]
        );
    }
}
