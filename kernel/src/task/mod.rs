//! Task lifecycle: the schedulable unit and everything it owns.
//!
//! A task bundles its CPU state (a hardware TSS image), its descriptor-table
//! allocations, its memory regions, its kernel stack, its IPC mailbox and its
//! open files. Construction wires all of that up; the scheduler only flips
//! states and descriptors afterwards.

pub mod scheduler;
pub mod tss;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::fs::vfs::VFS;
use crate::fs::FileHandle;
use crate::gdt::{
    self, Descriptor, FarPtr, Gdt, Selector, KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR,
    USER_CODE_SELECTOR, USER_DATA_SELECTOR,
};
use crate::ipc::{Handle, Mailbox};
use crate::mem::zone::{MemoryManager, Zone};
use crate::mem::{LinearAddress, PAGE_SIZE};
use tss::Tss;

pub type Pid = u32;

/// Only IF (and the always-set reserved bit) when a task boots.
const BOOT_EFLAGS: u32 = 0x0202;

/// Every task gets 16 KiB of stack.
const DEFAULT_STACK_SIZE: u32 = 16 * 1024;

/// Auto-placed regions start here and are separated by a guard gap.
const FIRST_REGION: u32 = 0x60_0000;
const REGION_GUARD: u32 = 16 * 1024;

const LDT_ENTRY_COUNT: usize = 4;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Ring {
    Ring0,
    Ring3,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskState {
    Runnable,
    Running,
    BlockedReceive,
    BlockedSend,
    BlockedSleep,
    Crashing,
    Exiting,
}

impl TaskState {
    pub fn is_blocked(self) -> bool {
        matches!(
            self,
            TaskState::BlockedReceive | TaskState::BlockedSend | TaskState::BlockedSleep
        )
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SpawnError {
    /// Zone or stack allocation failed.
    OutOfMemory,
}

/// Where a new task starts executing.
#[derive(Clone, Copy)]
pub enum TaskEntry {
    /// Kernel-space function, entered in ring 0.
    Kernel(fn() -> !),
    /// Address of resident code bytes; one page is copied into the task's
    /// code region and entered in ring 3.
    User(*const u8),
}

/// A linear-address range bound to a physical zone.
pub struct Region {
    base: LinearAddress,
    size: u32,
    zone: Arc<Zone>,
    name: String,
}

impl Region {
    pub fn base(&self) -> LinearAddress {
        self.base
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn zone(&self) -> &Arc<Zone> {
        &self.zone
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A 16 KiB stack carved out of the kernel heap.
///
/// There is deliberately no `Drop`: the stack of an exiting task is the one
/// the CPU is still executing on, so teardown leaks it. Reclaiming from the
/// successor task is a possible follow-up.
pub struct KernelStack {
    base: *mut u8,
    size: usize,
}

impl KernelStack {
    fn allocate() -> Option<KernelStack> {
        let layout =
            core::alloc::Layout::from_size_align(DEFAULT_STACK_SIZE as usize, 16).ok()?;
        // SAFETY: layout has non-zero size and power-of-two alignment.
        let base = unsafe { alloc::alloc::alloc(layout) };
        if base.is_null() {
            return None;
        }
        Some(KernelStack {
            base,
            size: DEFAULT_STACK_SIZE as usize,
        })
    }

    /// Top of the stack, aligned down to 8 bytes for the initial `esp`.
    fn top(&self) -> u32 {
        ((self.base as usize + self.size) & !7) as u32
    }
}

/// LDT storage for a ring-3 task plus the GDT slot describing it.
struct Ldt {
    entries: Box<[Descriptor; LDT_ENTRY_COUNT]>,
    selector: Selector,
}

pub struct Task {
    pid: Pid,
    name: String,
    handle: Handle,
    uid: u32,
    ring: Ring,
    state: TaskState,

    pub tss: Tss,
    selector: Option<Selector>,
    far_ptr: FarPtr,
    ldt: Option<Ldt>,

    regions: Vec<Region>,
    next_region: LinearAddress,
    kernel_stack: Option<KernelStack>,

    ticks_left: u32,
    wakeup_time: u64,

    pub mailbox: Mailbox,
    file_handles: Vec<Option<FileHandle>>,
}

impl Task {
    /// Builds a task ready to be scheduled. The caller assigns the pid and
    /// owns runqueue insertion.
    pub fn new(
        pid: Pid,
        name: &str,
        handle: Handle,
        ring: Ring,
        entry: TaskEntry,
        gdt: &mut Gdt,
        mm: &mut dyn MemoryManager,
    ) -> Result<Box<Task>, SpawnError> {
        let mut task = Box::new(Task {
            pid,
            name: String::from(name),
            handle,
            uid: 0,
            ring,
            state: TaskState::Runnable,
            tss: Tss::zeroed(),
            selector: None,
            far_ptr: FarPtr::default(),
            ldt: None,
            regions: Vec::new(),
            next_region: LinearAddress::new(FIRST_REGION),
            kernel_stack: None,
            ticks_left: 0,
            wakeup_time: 0,
            mailbox: Mailbox::new(),
            file_handles: Vec::new(),
        });

        let mut code_base = LinearAddress::new(0);
        if ring == Ring::Ring3 {
            let code_index = task.allocate_region(mm, PAGE_SIZE, "code")?;
            code_base = task.regions[code_index].base();
            if let TaskEntry::User(src) = entry {
                let zone = &task.regions[code_index].zone;
                if !mm.copy_to_zone(zone, src, PAGE_SIZE as usize) {
                    return Err(SpawnError::OutOfMemory);
                }
            }

            task.allocate_ldt(gdt);
        }

        task.tss.eflags = BOOT_EFLAGS;

        let (code_segment, data_segment) = match ring {
            Ring::Ring0 => (KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR),
            Ring::Ring3 => (USER_CODE_SELECTOR, USER_DATA_SELECTOR),
        };

        task.tss.cs = code_segment;
        task.tss.ds = data_segment;
        task.tss.es = data_segment;
        task.tss.fs = data_segment;
        task.tss.gs = data_segment;
        task.tss.ss = data_segment;
        assert_eq!(task.tss.cs & 3, task.tss.ss & 3);

        task.tss.cr3 = mm.page_directory_base().get();

        match (ring, entry) {
            (Ring::Ring0, TaskEntry::Kernel(entry)) => {
                task.tss.eip = entry as usize as u32;

                let stack = KernelStack::allocate().ok_or(SpawnError::OutOfMemory)?;
                task.tss.esp = stack.top();
                task.kernel_stack = Some(stack);
            }
            (Ring::Ring3, _) => {
                task.tss.eip = code_base.get();

                let stack_index = task.allocate_region(mm, DEFAULT_STACK_SIZE, "stack")?;
                let stack_region = &task.regions[stack_index];
                task.tss.esp = stack_region.base().offset(stack_region.size()).get() & !7;

                // Separate stack for ring-0 entry on interrupts and syscalls.
                let stack = KernelStack::allocate().ok_or(SpawnError::OutOfMemory)?;
                task.tss.ss0 = KERNEL_DATA_SELECTOR;
                task.tss.esp0 = stack.top();
                task.kernel_stack = Some(stack);
            }
            (Ring::Ring0, TaskEntry::User(_)) => {
                // A ring-0 task always enters through a kernel function.
                panic!("[TASK] ring-0 task {} given a user entry", name);
            }
        }

        Ok(task)
    }

    /// Places a new region at the cursor and advances it past a guard gap.
    /// Returns the region's index. Overlap with existing regions is not
    /// checked yet.
    pub fn allocate_region(
        &mut self,
        mm: &mut dyn MemoryManager,
        size: u32,
        name: &str,
    ) -> Result<usize, SpawnError> {
        let zone = mm.create_zone(size).ok_or(SpawnError::OutOfMemory)?;
        self.regions.push(Region {
            base: self.next_region,
            size,
            zone,
            name: String::from(name),
        });
        self.next_region = self.next_region.offset(size).offset(REGION_GUARD);
        Ok(self.regions.len() - 1)
    }

    /// Allocates the (empty) LDT and publishes it through the GDT. The
    /// entries stay unpopulated; ring-3 tasks use the flat GDT selectors.
    fn allocate_ldt(&mut self, gdt: &mut Gdt) {
        assert_eq!(self.tss.ldt, 0);

        let selector = match gdt.allocate_slot() {
            Some(selector) => selector,
            None => panic!("[TASK] GDT exhausted allocating LDT for {}", self.name),
        };

        let entries = Box::new([Descriptor::null(); LDT_ENTRY_COUNT]);
        let descriptor = gdt.entry_mut(selector);
        descriptor.set_base(entries.as_ptr() as usize as u32);
        descriptor.set_limit((LDT_ENTRY_COUNT * 8 - 1) as u32);
        descriptor.set_dpl(0);
        descriptor.set_present(true);
        descriptor.set_granularity(false);
        descriptor.set_operation_size(true);
        descriptor.set_descriptor_type(false);
        descriptor.set_type(gdt::TYPE_LDT);

        self.tss.ldt = selector.raw();
        self.ldt = Some(Ldt { entries, selector });
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn ring(&self) -> Ring {
        self.ring
    }

    pub fn is_ring3(&self) -> bool {
        self.ring == Ring::Ring3
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn set_state(&mut self, state: TaskState) {
        self.state = state;
    }

    pub fn selector(&self) -> Option<Selector> {
        self.selector
    }

    pub fn set_selector(&mut self, selector: Selector) {
        self.selector = Some(selector);
        self.far_ptr.selector = selector.raw();
    }

    pub fn ldt_selector(&self) -> Option<Selector> {
        self.ldt.as_ref().map(|ldt| ldt.selector)
    }

    pub fn ldt_entries(&self) -> Option<&[Descriptor]> {
        self.ldt.as_ref().map(|ldt| &ldt.entries[..])
    }

    /// Operand for the far jump that switches to this task. The offset part
    /// is ignored by the CPU.
    pub fn far_ptr(&self) -> FarPtr {
        self.far_ptr
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// The heap stack backing `esp` (ring 0) or `esp0` (ring 3).
    pub fn kernel_stack(&self) -> Option<&KernelStack> {
        self.kernel_stack.as_ref()
    }

    pub fn ticks_left(&self) -> u32 {
        self.ticks_left
    }

    pub fn set_ticks_left(&mut self, ticks: u32) {
        self.ticks_left = ticks;
    }

    pub fn wakeup_time(&self) -> u64 {
        self.wakeup_time
    }

    pub fn set_wakeup_time(&mut self, when: u64) {
        self.wakeup_time = when;
    }

    pub fn dump_regions(&self) {
        crate::serial_println!("[TASK] {} ({}) regions:", self.name, self.pid);
        crate::serial_println!("BEGIN       END         SIZE        NAME");
        for region in &self.regions {
            crate::serial_println!(
                "{:#010x}  {:#010x}  {:#010x}  {}",
                region.base.get(),
                region.base.offset(region.size - 1).get(),
                region.size,
                region.name
            );
        }
    }

    fn file_handle_mut(&mut self, fd: i32) -> Option<&mut FileHandle> {
        if fd < 0 {
            return None;
        }
        self.file_handles.get_mut(fd as usize)?.as_mut()
    }

    /// Opens `path` and appends a handle; the fd is the append position.
    pub fn sys_open(&mut self, path: &str) -> i32 {
        let node = match VFS.lock().open(path) {
            Ok(node) => node,
            Err(_) => return -1,
        };
        let fd = self.file_handles.len() as i32;
        self.file_handles.push(Some(FileHandle::new(fd, node)));
        fd
    }

    pub fn sys_read(&mut self, fd: i32, buf: &mut [u8]) -> i32 {
        match self.file_handle_mut(fd) {
            Some(handle) => match handle.read(buf) {
                Ok(n) => n as i32,
                Err(_) => -1,
            },
            None => -1,
        }
    }

    /// Tombstones the fd so later reads on it fail; the slot is not reused.
    pub fn sys_close(&mut self, fd: i32) -> i32 {
        if fd < 0 || fd as usize >= self.file_handles.len() {
            return -1;
        }
        match self.file_handles[fd as usize].take() {
            Some(_) => 0,
            None => -1,
        }
    }

    pub fn sys_seek(&mut self, fd: i32, offset: i32) -> i32 {
        match self.file_handle_mut(fd) {
            Some(handle) => match handle.seek(offset) {
                Ok(position) => position,
                Err(_) => -1,
            },
            None => -1,
        }
    }

    pub fn sys_getuid(&self) -> u32 {
        self.uid
    }
}
