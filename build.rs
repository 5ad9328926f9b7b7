use std::env;

fn main() {
    println!("cargo:rerun-if-changed=linker.ld");

    // only the freestanding boot image needs the multiboot layout
    let arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    if arch == "x86" && env::var_os("CARGO_FEATURE_KERNEL_IMAGE").is_some() {
        let dir = env::var("CARGO_MANIFEST_DIR").unwrap_or_default();
        println!("cargo:rustc-link-arg-bins=-T{}/linker.ld", dir);
    }
}
