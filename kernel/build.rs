fn main() {
    // Inform cargo to rerun if the linker script changes
    println!("cargo:rerun-if-changed=linker.ld");

    // The linker script only applies to the bare-metal kernel binary.
    let target_arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_arch == "x86" && target_os == "none" {
        let script = std::path::PathBuf::from(std::env::var("CARGO_MANIFEST_DIR").unwrap())
            .join("linker.ld");
        println!("cargo:rustc-link-arg-bins=-T{}", script.display());
        println!("cargo:rustc-link-arg-bins=-nostartfiles");
    }
}
