#![no_std]
#![no_main]

use core::{arch::global_asm, panic::PanicInfo};

use myos::{
    arch::i686::I686,
    idle_loop, init,
    kernel::BootInfo,
    logging, serial_println, unrecoverable,
};

const MULTIBOOT_BOOTLOADER_MAGIC: u32 = 0x2BAD_B002;
const MULTIBOOT_INFO_MEMORY: u32 = 1 << 0;

// Multiboot v1 header (page-align modules, request memory info), a boot
// stack, and the entry point handing magic and info pointer to kmain.
global_asm!(
    ".section .multiboot, \"a\"",
    ".align 4",
    ".long 0x1BADB002",
    ".long 0x00000003",
    ".long -(0x1BADB002 + 0x00000003)",
    ".section .bss",
    ".align 16",
    "boot_stack_bottom:",
    ".skip 262144",
    "boot_stack_top:",
    ".section .text",
    ".global _start",
    "_start:",
    "    mov esp, offset boot_stack_top",
    "    push ebx",
    "    push eax",
    "    call kmain",
    "2:",
    "    cli",
    "    hlt",
    "    jmp 2b",
);

/// Leading fields of the multiboot information structure.
#[repr(C)]
struct MultibootInfo {
    flags: u32,
    mem_lower: u32,
    mem_upper: u32,
}

#[no_mangle]
extern "C" fn kmain(magic: u32, info: *const MultibootInfo) -> ! {
    if logging::init().is_err() {
        serial_println!("Logger already installed");
    }

    if magic != MULTIBOOT_BOOTLOADER_MAGIC {
        unrecoverable::<I686>(format_args!(
            "Invalid multiboot magic: expected {:#x}, got {:#x}",
            MULTIBOOT_BOOTLOADER_MAGIC, magic
        ));
    }

    // SAFETY: the boot loader passes a valid info pointer with the magic
    let info = unsafe { &*info };
    if info.flags & MULTIBOOT_INFO_MEMORY == 0 {
        unrecoverable::<I686>(format_args!("Boot loader did not report memory sizes"));
    }

    let boot = BootInfo {
        mem_lower_kb: info.mem_lower,
        mem_upper_kb: info.mem_upper,
    };
    if let Err(e) = init::init(boot) {
        unrecoverable::<I686>(format_args!("Kernel initialization failed: {}", e));
    }

    log::info!("Starting scheduler");
    init::start();
    idle_loop::<I686>()
}

#[panic_handler]
fn rust_panic(info: &PanicInfo) -> ! {
    unrecoverable::<I686>(format_args!("Kernel panic: {}", info))
}
