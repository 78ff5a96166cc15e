//! CinderOS kernel entry point: multiboot header, boot stack, bring-up
//! order, and the demo tasks.

#![no_std]
#![no_main]

extern crate alloc;

use core::fmt::Write;
use core::panic::PanicInfo;

use cinder_os::ipc::{Handle, Message, SourceFilter};
use cinder_os::mem::manager::KernelMemoryManager;
use cinder_os::mem::{heap, physical, PhysicalAddress};
use cinder_os::task::scheduler;
use cinder_os::{arch, drivers, interrupt, serial_println};

const MULTIBOOT_MAGIC: u32 = 0x1BAD_B002;

#[link_section = ".multiboot_header"]
#[used]
static MULTIBOOT_HEADER: [u32; 3] = [MULTIBOOT_MAGIC, 0, 0u32.wrapping_sub(MULTIBOOT_MAGIC)];

const BOOT_STACK_SIZE: usize = 16 * 1024;

#[repr(C, align(16))]
struct BootStack([u8; BOOT_STACK_SIZE]);

static mut BOOT_STACK: BootStack = BootStack([0; BOOT_STACK_SIZE]);

extern "C" {
    static __kernel_end: u8;
}

#[unsafe(naked)]
#[no_mangle]
pub unsafe extern "C" fn _start() -> ! {
    core::arch::naked_asm!(
        "lea esp, [{stack} + {stack_size}]",
        "call {main}",
        "2:",
        "hlt",
        "jmp 2b",
        stack = sym BOOT_STACK,
        stack_size = const BOOT_STACK_SIZE,
        main = sym kernel_main,
    )
}

extern "C" fn kernel_main() -> ! {
    arch::disable_interrupts();

    drivers::serial::init();
    drivers::serial::write("\ncinder 0.1.0\n");

    // Heap first: logging and every collection allocate.
    heap::init();

    let kernel_end = unsafe { &__kernel_end as *const u8 as usize as u32 };
    physical::FRAME_ALLOCATOR
        .lock()
        .init(PhysicalAddress::new(kernel_end));

    let mm = KernelMemoryManager::new();
    mm.activate();

    cinder_os::fs::vfs::init();
    interrupt::init();
    drivers::timer::init();

    scheduler::init(mm);

    let sched = scheduler::the();
    if sched
        .spawn_kernel_task("ticker", Handle(1), ticker_main)
        .is_err()
    {
        panic!("[BOOT] failed to spawn ticker");
    }
    if sched
        .spawn_kernel_task("greeter", Handle(2), greeter_main)
        .is_err()
    {
        panic!("[BOOT] failed to spawn greeter");
    }

    serial_println!("[BOOT] entering the scheduler");

    // The first switch adopts this context as the idle task; from here on
    // this loop only runs when nothing else wants the CPU.
    loop {
        scheduler::the().yield_now();
        arch::halt();
    }
}

/// Logs a heartbeat every second and greets the greeter once.
fn ticker_main() -> ! {
    let mut greeted = false;
    loop {
        scheduler::the().sleep(100);
        serial_println!("[TICK] uptime {}", scheduler::the().uptime());

        if !greeted {
            greeted = true;
            scheduler::the().send(
                Handle(2),
                Message::new(1, Handle(1), alloc::vec::Vec::from(*b"hello")),
            );
        }
    }
}

/// Exercises the file and IPC paths, then exits.
fn greeter_main() -> ! {
    let sched = scheduler::the();

    let fd = match sched.current_task_mut() {
        Some(task) => task.sys_open("/dev/null"),
        None => -1,
    };
    serial_println!("[DEMO] opened /dev/null as fd {}", fd);

    if let Some(message) = scheduler::the().receive(SourceFilter::Any) {
        serial_println!(
            "[DEMO] message kind {} from {:?} ({} bytes)",
            message.kind,
            message.sender,
            message.data.len()
        );
    }

    scheduler::the().exit_current(0);
    unreachable!()
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    arch::disable_interrupts();

    struct PanicWriter;
    impl Write for PanicWriter {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            drivers::serial::write(s);
            Ok(())
        }
    }

    drivers::serial::write("\n*** KERNEL PANIC ***\n");
    let _ = writeln!(PanicWriter, "{}", info);

    loop {
        arch::halt();
    }
}
