//! 32-bit protected mode implementation of [`Cpu`].

use core::arch::{asm, global_asm};

use super::{Context, Cpu};
use crate::memory::{PhysFrame, VirtAddr};

// extern "C" fn myos_switch_context(prev: *mut Context, next: *const Context)
//
// prev may be null when the outgoing context is discarded. Offsets follow
// the field order of `Context`: esp 0, ebp 4, eip 8, ebx 12, esi 16,
// edi 20, eflags 24.
global_asm!(
    ".global myos_switch_context",
    "myos_switch_context:",
    "    mov eax, [esp + 4]",
    "    mov edx, [esp + 8]",
    "    test eax, eax",
    "    jz 2f",
    "    mov [eax + 4], ebp",
    "    mov [eax + 12], ebx",
    "    mov [eax + 16], esi",
    "    mov [eax + 20], edi",
    "    pushfd",
    "    pop ecx",
    "    mov [eax + 24], ecx",
    "    mov [eax + 0], esp",
    "    lea ecx, [3f]",
    "    mov [eax + 8], ecx",
    "2:",
    "    mov esp, [edx + 0]",
    "    mov ebp, [edx + 4]",
    "    mov ebx, [edx + 12]",
    "    mov esi, [edx + 16]",
    "    mov edi, [edx + 20]",
    "    mov ecx, [edx + 8]",
    "    push dword ptr [edx + 24]",
    "    popfd",
    "    jmp ecx",
    // resumed: esp points at our caller's return address again
    "3:",
    "    ret",
);

extern "C" {
    fn myos_switch_context(prev: *mut Context, next: *const Context);
}

/// Where a process lands when its entry function returns.
extern "C" fn process_return() -> ! {
    crate::interrupts::exit_current(0);
    loop {
        I686::halt();
    }
}

pub struct I686;

impl Cpu for I686 {
    fn interrupts_enabled() -> bool {
        let eflags: u32;
        unsafe {
            asm!("pushfd", "pop {}", out(reg) eflags, options(nomem, preserves_flags));
        }
        eflags & (1 << 9) != 0
    }

    fn disable_interrupts() {
        unsafe { asm!("cli", options(nomem, nostack)) };
    }

    fn enable_interrupts() {
        unsafe { asm!("sti", options(nomem, nostack)) };
    }

    fn halt() {
        unsafe { asm!("hlt", options(nomem, nostack, preserves_flags)) };
    }

    unsafe fn load_directory(directory: PhysFrame) {
        asm!(
            "mov cr3, {}",
            in(reg) directory.start_address().as_u32(),
            options(nostack, preserves_flags)
        );
    }

    unsafe fn enable_paging() {
        asm!(
            "mov {tmp}, cr0",
            "or {tmp}, 0x80000000",
            "mov cr0, {tmp}",
            tmp = out(reg) _,
            options(nostack)
        );
    }

    fn invalidate_page(addr: VirtAddr) {
        unsafe {
            asm!("invlpg [{}]", in(reg) addr.as_u32(), options(nostack, preserves_flags));
        }
    }

    unsafe fn prepare_stack(context: &Context) {
        let slot = context.esp as *mut u32;
        slot.write_volatile(process_return as usize as u32);
    }

    unsafe fn switch_context(prev: Option<*mut Context>, next: *const Context) {
        myos_switch_context(prev.unwrap_or(core::ptr::null_mut()), next);
    }
}
