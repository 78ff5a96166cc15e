//! Synchronization primitives beyond what the `spin` crate provides.

pub mod interrupts;

pub use interrupts::InterruptGuard;
