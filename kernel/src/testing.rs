//! Unit-test support: recording doubles for the hardware and memory seams.
//!
//! The scheduler only touches the CPU and the page directory through the
//! `CpuContext` and `MemoryManager` traits, so host-side tests substitute
//! these fakes and assert on what the core asked the hardware to do.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::arch::CpuContext;
use crate::gdt::{FarPtr, Gdt, Selector};
use crate::mem::zone::{MemoryManager, Zone};
use crate::mem::PhysicalAddress;
use crate::task::scheduler::Scheduler;
use crate::task::{Pid, Task};

#[derive(Default)]
pub struct CpuLog {
    pub flushes: usize,
    pub task_register: Option<u16>,
    /// Selectors jumped through, in order.
    pub switches: Vec<u16>,
}

pub struct FakeCpu {
    log: Arc<Mutex<CpuLog>>,
}

impl FakeCpu {
    pub fn new() -> (FakeCpu, Arc<Mutex<CpuLog>>) {
        let log = Arc::new(Mutex::new(CpuLog::default()));
        (FakeCpu { log: log.clone() }, log)
    }
}

impl CpuContext for FakeCpu {
    fn flush_gdt(&mut self, _gdt: &Gdt) {
        self.log.lock().flushes += 1;
    }

    fn load_task_register(&mut self, selector: Selector) {
        self.log.lock().task_register = Some(selector.raw());
    }

    fn task_switch(&mut self, _gdt: &mut Gdt, selector: Selector, _far_ptr: FarPtr) {
        self.log.lock().switches.push(selector.raw());
    }
}

#[derive(Default)]
pub struct MmLog {
    pub zones: usize,
    pub copies: usize,
    pub mapped: Vec<Pid>,
    pub unmapped: Vec<Pid>,
}

pub struct FakeMemoryManager {
    log: Arc<Mutex<MmLog>>,
}

impl FakeMemoryManager {
    pub fn new() -> FakeMemoryManager {
        FakeMemoryManager {
            log: Arc::new(Mutex::new(MmLog::default())),
        }
    }

    pub fn log(&self) -> Arc<Mutex<MmLog>> {
        self.log.clone()
    }

    pub fn copies(&self) -> usize {
        self.log.lock().copies
    }
}

impl MemoryManager for FakeMemoryManager {
    fn create_zone(&mut self, size: u32) -> Option<Arc<Zone>> {
        self.log.lock().zones += 1;
        // No frames behind it: nothing goes back to the global pool when
        // the zone drops, so tests stay independent.
        Some(Arc::new(Zone::new(Vec::new(), size)))
    }

    fn copy_to_zone(&mut self, _zone: &Zone, _src: *const u8, _len: usize) -> bool {
        self.log.lock().copies += 1;
        true
    }

    fn map_regions_for(&mut self, task: &Task) -> bool {
        self.log.lock().mapped.push(task.pid());
        true
    }

    fn unmap_regions_for(&mut self, task: &Task) -> bool {
        self.log.lock().unmapped.push(task.pid());
        true
    }

    fn page_directory_base(&self) -> PhysicalAddress {
        PhysicalAddress::new(0x1000)
    }
}

/// Memory manager whose zone allocation always fails, for spawn-error paths.
pub struct FailingMemoryManager;

impl MemoryManager for FailingMemoryManager {
    fn create_zone(&mut self, _size: u32) -> Option<Arc<Zone>> {
        None
    }

    fn copy_to_zone(&mut self, _zone: &Zone, _src: *const u8, _len: usize) -> bool {
        false
    }

    fn map_regions_for(&mut self, _task: &Task) -> bool {
        true
    }

    fn unmap_regions_for(&mut self, _task: &Task) -> bool {
        true
    }

    fn page_directory_base(&self) -> PhysicalAddress {
        PhysicalAddress::new(0x1000)
    }
}

/// A scheduler wired to fakes, plus the logs to inspect what it did.
pub fn fixture() -> (Scheduler, Arc<Mutex<CpuLog>>, Arc<Mutex<MmLog>>) {
    let (cpu, cpu_log) = FakeCpu::new();
    let mm = FakeMemoryManager::new();
    let mm_log = mm.log();
    let scheduler = Scheduler::new(Box::new(cpu), Box::new(mm));
    (scheduler, cpu_log, mm_log)
}
