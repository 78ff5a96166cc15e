//! Scoped interrupt masking.
//!
//! Scheduler entry points hold an `InterruptGuard` from the first runqueue
//! mutation until after the far jump (or until they decide not to switch).
//! The guard restores the previous interrupt state on every exit path.

use crate::arch;

pub struct InterruptGuard {
    were_enabled: bool,
}

impl InterruptGuard {
    pub fn hold() -> Self {
        let were_enabled = arch::interrupts_enabled();
        arch::disable_interrupts();
        InterruptGuard { were_enabled }
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            arch::enable_interrupts();
        }
    }
}
