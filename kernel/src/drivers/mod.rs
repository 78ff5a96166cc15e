//! Hardware drivers: serial console and the scheduling timer.

pub mod serial;

#[cfg(target_arch = "x86")]
pub mod timer;
