//! IDT setup, PIC remap, and the exception-to-teardown glue.
//!
//! Unhandled faults in the current task do not bring the kernel down: the
//! handler routes into the scheduler's crash teardown, which picks a
//! successor and far-jumps away from the faulting context.

use core::arch::asm;

use crate::arch::outb;
use crate::gdt::KERNEL_CODE_SELECTOR;
use crate::task::scheduler;

const IDT_ENTRIES: usize = 256;

const IRQ_BASE: u8 = 32;
pub const IRQ0_PIT_TIMER_VECTOR: u8 = IRQ_BASE;

const PIC1_COMMAND: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_COMMAND: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;
const PIC_EOI: u8 = 0x20;

// Present, DPL 0, 32-bit interrupt gate.
const GATE_FLAGS: u8 = 0x8E;

/// What the CPU pushes for a 32-bit interrupt without privilege change.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InterruptStackFrame {
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
}

#[derive(Copy, Clone)]
#[repr(C, packed)]
struct IdtEntry {
    offset_lo: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_hi: u16,
}

impl IdtEntry {
    const fn missing() -> Self {
        IdtEntry {
            offset_lo: 0,
            selector: 0,
            zero: 0,
            type_attr: 0,
            offset_hi: 0,
        }
    }

    fn set_handler(&mut self, handler: u32) {
        self.offset_lo = handler as u16;
        self.offset_hi = (handler >> 16) as u16;
        self.selector = KERNEL_CODE_SELECTOR;
        self.zero = 0;
        self.type_attr = GATE_FLAGS;
    }
}

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u32,
}

static mut IDT: [IdtEntry; IDT_ENTRIES] = [IdtEntry::missing(); IDT_ENTRIES];

/// Builds the IDT, remaps the PIC, and unmasks the timer line.
#[allow(static_mut_refs)]
pub fn init() {
    unsafe {
        IDT[0].set_handler(divide_error_handler as usize as u32);
        IDT[6].set_handler(invalid_opcode_handler as usize as u32);
        IDT[13].set_handler(general_protection_handler as usize as u32);
        IDT[14].set_handler(page_fault_handler as usize as u32);
        IDT[IRQ0_PIT_TIMER_VECTOR as usize].set_handler(timer_handler as usize as u32);

        let pointer = IdtPointer {
            limit: (core::mem::size_of::<[IdtEntry; IDT_ENTRIES]>() - 1) as u16,
            base: IDT.as_ptr() as usize as u32,
        };
        asm!("lidt [{}]", in(reg) &pointer, options(nostack));
    }

    remap_pic();
    crate::serial_println!("[IDT] {} gates, PIC remapped to {}", IDT_ENTRIES, IRQ_BASE);
}

/// Moves the PIC vectors above the exception range and masks everything
/// except the timer line.
fn remap_pic() {
    unsafe {
        outb(PIC1_COMMAND, 0x11);
        outb(PIC2_COMMAND, 0x11);
        outb(PIC1_DATA, IRQ_BASE);
        outb(PIC2_DATA, IRQ_BASE + 8);
        outb(PIC1_DATA, 0x04);
        outb(PIC2_DATA, 0x02);
        outb(PIC1_DATA, 0x01);
        outb(PIC2_DATA, 0x01);

        // Mask all but IRQ0 (timer) and the cascade.
        outb(PIC1_DATA, !0b0000_0101);
        outb(PIC2_DATA, 0xFF);
    }
}

fn end_of_interrupt() {
    unsafe { outb(PIC1_COMMAND, PIC_EOI) };
}

extern "x86-interrupt" fn timer_handler(_frame: InterruptStackFrame) {
    // EOI first: the tick below may far-jump to another task.
    end_of_interrupt();
    scheduler::on_timer_tick();
}

extern "x86-interrupt" fn divide_error_handler(frame: InterruptStackFrame) {
    crate::serial_println!("[INT] divide error at {:#010x}", frame.eip);
    scheduler::current_task_crashed();
}

extern "x86-interrupt" fn invalid_opcode_handler(frame: InterruptStackFrame) {
    crate::serial_println!("[INT] invalid opcode at {:#010x}", frame.eip);
    scheduler::current_task_crashed();
}

extern "x86-interrupt" fn general_protection_handler(frame: InterruptStackFrame, error: u32) {
    crate::serial_println!(
        "[INT] general protection fault at {:#010x} (error {:#x})",
        frame.eip,
        error
    );
    scheduler::current_task_crashed();
}

extern "x86-interrupt" fn page_fault_handler(frame: InterruptStackFrame, error: u32) {
    let cr2: u32;
    unsafe { asm!("mov {}, cr2", out(reg) cr2, options(nostack)) };
    crate::serial_println!(
        "[INT] page fault at {:#010x} touching {:#010x} (error {:#x})",
        frame.eip,
        cr2,
        error
    );
    scheduler::current_task_crashed();
}
