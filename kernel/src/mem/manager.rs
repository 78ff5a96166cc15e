//! The kernel memory manager: owns the boot page directory and binds task
//! regions into it around each context switch.
//!
//! The low 6 MiB are identity mapped at boot, which covers the kernel image,
//! the heap window and all page tables. Task regions live above that and are
//! mapped in and out as the scheduler switches tasks.

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::zone::{MemoryManager, Zone};
use super::{page_round_up, physical, LinearAddress, PhysicalAddress, PAGE_SIZE};
use crate::task::Task;

const ENTRIES_PER_TABLE: usize = 1024;

// Task regions are placed from 0x600000 upward; the identity window stays
// below that so region mappings never clobber it.
const IDENTITY_MAPPED: u32 = 6 * 1024 * 1024;

const FLAG_PRESENT: u32 = 1 << 0;
const FLAG_WRITABLE: u32 = 1 << 1;
const FLAG_USER: u32 = 1 << 2;

pub struct KernelMemoryManager {
    page_directory: PhysicalAddress,
}

impl KernelMemoryManager {
    /// Builds the boot page directory with the low memory identity mapped.
    pub fn new() -> Self {
        let page_directory = match physical::allocate_frame() {
            Some(frame) => frame,
            None => panic!("[MEM] no frame available for the page directory"),
        };

        let mut mm = KernelMemoryManager { page_directory };

        unsafe {
            core::ptr::write_bytes(page_directory.get() as *mut u8, 0, PAGE_SIZE as usize);
        }

        let mut addr = 0;
        while addr < IDENTITY_MAPPED {
            mm.map_page(
                LinearAddress::new(addr),
                PhysicalAddress::new(addr),
                false,
            );
            addr += PAGE_SIZE;
        }

        crate::serial_println!(
            "[MEM] Page directory at {:?}, identity mapped {} MiB",
            page_directory,
            IDENTITY_MAPPED / (1024 * 1024)
        );

        mm
    }

    /// Loads the page directory into CR3 and turns paging on.
    pub fn activate(&self) {
        unsafe {
            crate::arch::load_cr3(self.page_directory.get());
            crate::arch::enable_paging();
        }
    }

    // Physical memory is reachable through the identity mapping, so a table
    // address can be dereferenced directly.
    unsafe fn table_mut(addr: PhysicalAddress) -> &'static mut [u32; ENTRIES_PER_TABLE] {
        &mut *(addr.get() as *mut [u32; ENTRIES_PER_TABLE])
    }

    fn ensure_page_table(&mut self, pde_index: usize, user: bool) -> PhysicalAddress {
        let directory = unsafe { Self::table_mut(self.page_directory) };
        let entry = directory[pde_index];

        if entry & FLAG_PRESENT != 0 {
            return PhysicalAddress::new(entry & !(PAGE_SIZE - 1));
        }

        let table = match physical::allocate_frame() {
            Some(frame) => frame,
            None => panic!("[MEM] no frame available for a page table"),
        };
        unsafe {
            core::ptr::write_bytes(table.get() as *mut u8, 0, PAGE_SIZE as usize);
        }

        let mut flags = FLAG_PRESENT | FLAG_WRITABLE;
        if user {
            flags |= FLAG_USER;
        }
        directory[pde_index] = table.get() | flags;

        table
    }

    fn map_page(&mut self, linear: LinearAddress, phys: PhysicalAddress, user: bool) {
        let pde_index = (linear.get() >> 22) as usize;
        let pte_index = ((linear.get() >> 12) & 0x3FF) as usize;

        let table_addr = self.ensure_page_table(pde_index, user);
        let table = unsafe { Self::table_mut(table_addr) };

        let mut flags = FLAG_PRESENT | FLAG_WRITABLE;
        if user {
            flags |= FLAG_USER;
        }
        table[pte_index] = phys.get() | flags;

        unsafe { crate::arch::invalidate_page(linear.get()) };
    }

    fn unmap_page(&mut self, linear: LinearAddress) -> bool {
        let pde_index = (linear.get() >> 22) as usize;
        let pte_index = ((linear.get() >> 12) & 0x3FF) as usize;

        let directory = unsafe { Self::table_mut(self.page_directory) };
        if directory[pde_index] & FLAG_PRESENT == 0 {
            return false;
        }

        let table_addr = PhysicalAddress::new(directory[pde_index] & !(PAGE_SIZE - 1));
        let table = unsafe { Self::table_mut(table_addr) };
        if table[pte_index] & FLAG_PRESENT == 0 {
            return false;
        }

        table[pte_index] = 0;
        unsafe { crate::arch::invalidate_page(linear.get()) };
        true
    }
}

impl MemoryManager for KernelMemoryManager {
    fn create_zone(&mut self, size: u32) -> Option<Arc<Zone>> {
        let pages = page_round_up(size) / PAGE_SIZE;
        let mut frames = Vec::with_capacity(pages as usize);

        for _ in 0..pages {
            match physical::allocate_frame() {
                Some(frame) => frames.push(frame),
                None => {
                    // Hand back what we already took and fail the request.
                    for frame in frames {
                        physical::free_frame(frame);
                    }
                    return None;
                }
            }
        }

        Some(Arc::new(Zone::new(frames, size)))
    }

    fn copy_to_zone(&mut self, zone: &Zone, src: *const u8, len: usize) -> bool {
        let mut copied = 0;
        for &frame in zone.frames() {
            if copied >= len {
                break;
            }
            let chunk = (len - copied).min(PAGE_SIZE as usize);
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src.add(copied),
                    frame.get() as *mut u8,
                    chunk,
                );
            }
            copied += chunk;
        }
        copied >= len
    }

    fn map_regions_for(&mut self, task: &Task) -> bool {
        for region in task.regions() {
            let frames = region.zone().frames();
            for (i, &frame) in frames.iter().enumerate() {
                let linear = region.base().offset(i as u32 * PAGE_SIZE);
                self.map_page(linear, frame, task.is_ring3());
            }
        }
        true
    }

    fn unmap_regions_for(&mut self, task: &Task) -> bool {
        for region in task.regions() {
            for i in 0..region.zone().page_count() {
                let linear = region.base().offset(i as u32 * PAGE_SIZE);
                if !self.unmap_page(linear) {
                    return false;
                }
            }
        }
        true
    }

    fn page_directory_base(&self) -> PhysicalAddress {
        self.page_directory
    }
}
