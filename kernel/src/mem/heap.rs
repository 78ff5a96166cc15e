//! Kernel heap over a fixed identity-mapped window.

use linked_list_allocator::LockedHeap;

use super::{physical, PhysicalAddress};

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

pub const HEAP_START: u32 = 0x40_0000;
pub const HEAP_SIZE: u32 = 2 * 1024 * 1024;

/// Hands the heap window to the allocator and takes it out of the frame pool.
pub fn init() {
    physical::FRAME_ALLOCATOR.lock().reserve(
        PhysicalAddress::new(HEAP_START),
        PhysicalAddress::new(HEAP_START + HEAP_SIZE),
    );

    unsafe {
        ALLOCATOR
            .lock()
            .init(HEAP_START as *mut u8, HEAP_SIZE as usize);
    }

    crate::serial_println!(
        "[MEM] Kernel heap: {} KiB at {:#x}",
        HEAP_SIZE / 1024,
        HEAP_START
    );
}

pub fn used() -> usize {
    ALLOCATOR.lock().used()
}
