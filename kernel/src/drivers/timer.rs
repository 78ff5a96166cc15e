//! Programmable Interval Timer (PIT): the preemption heartbeat.

use crate::arch::outb;

const PIT_FREQUENCY: u32 = 1193182;
const TARGET_HZ: u32 = 100;

/// Programs channel 0 as a rate generator at [`TARGET_HZ`].
pub fn init() {
    let divisor = (PIT_FREQUENCY / TARGET_HZ) as u16;

    unsafe {
        // Channel 0, lobyte/hibyte access, rate generator
        outb(0x43, 0x36);
        outb(0x40, (divisor & 0xFF) as u8);
        outb(0x40, (divisor >> 8) as u8);
    }

    crate::serial_println!("[PIT] {} Hz tick", TARGET_HZ);
}
