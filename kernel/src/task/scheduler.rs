//! The scheduler: runqueue rotation, wake pass, and the context switch.
//!
//! One invariant rules this module: exactly one task runs, its address space
//! is installed, and its hardware descriptors are live. Every entry point
//! (voluntary yield, timer preemption, teardown) funnels through the same
//! wake-select-switch sequence with interrupts disabled throughout.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use super::tss::Tss;
use super::{Pid, Ring, SpawnError, Task, TaskEntry, TaskState};
use crate::arch::CpuContext;
use crate::gdt::{self, Gdt};
use crate::ipc::{Handle, Message, Notify, SourceFilter};
use crate::mem::zone::MemoryManager;
use crate::sync::InterruptGuard;

/// Timer ticks a task gets per schedule.
pub const QUANTUM: u32 = 5;

/// The idle task: created at boot, never queued, runs when nothing else can.
pub const IDLE_PID: Pid = 0;

const IDLE_NAME: &str = "colonel";

pub struct Scheduler {
    tasks: BTreeMap<Pid, Box<Task>>,
    /// All non-idle tasks, rotated head-to-tail each selection pass.
    runqueue: VecDeque<Pid>,
    current: Option<Pid>,
    next_pid: Pid,
    uptime: u64,
    nprocess: u32,
    nblocked: u32,
    gdt: Gdt,
    cpu: Box<dyn CpuContext>,
    mm: Box<dyn MemoryManager>,
}

fn idle_main() -> ! {
    loop {
        #[cfg(target_arch = "x86")]
        crate::arch::halt();
        #[cfg(not(target_arch = "x86"))]
        core::hint::spin_loop();
    }
}

impl Scheduler {
    /// Boots the scheduler: builds the GDT, creates the idle task and loads
    /// the task register so the first far jump has an outgoing TSS.
    pub fn new(cpu: Box<dyn CpuContext>, mm: Box<dyn MemoryManager>) -> Scheduler {
        let mut scheduler = Scheduler {
            tasks: BTreeMap::new(),
            runqueue: VecDeque::new(),
            current: None,
            next_pid: 0,
            uptime: 0,
            nprocess: 0,
            nblocked: 0,
            gdt: Gdt::new(),
            cpu,
            mm,
        };

        let idle = match scheduler.spawn(
            IDLE_NAME,
            Handle::NONE,
            Ring::Ring0,
            TaskEntry::Kernel(idle_main),
        ) {
            Ok(pid) => pid,
            Err(_) => panic!("[SCHED] failed to create the idle task"),
        };
        assert_eq!(idle, IDLE_PID);

        scheduler.ensure_selector(IDLE_PID);
        scheduler.write_tss_descriptor(IDLE_PID, gdt::TYPE_TSS_AVAILABLE);
        scheduler.cpu.flush_gdt(&scheduler.gdt);

        let selector = match scheduler.tasks[&IDLE_PID].selector() {
            Some(selector) => selector,
            None => panic!("[SCHED] idle task lost its selector"),
        };
        scheduler.cpu.load_task_register(selector);

        scheduler
    }

    pub fn spawn_kernel_task(
        &mut self,
        name: &str,
        handle: Handle,
        entry: fn() -> !,
    ) -> Result<Pid, SpawnError> {
        self.spawn(name, handle, Ring::Ring0, TaskEntry::Kernel(entry))
    }

    /// Spawns a ring-3 task whose first code page is copied from `code`.
    pub fn spawn_user_task(
        &mut self,
        name: &str,
        handle: Handle,
        code: *const u8,
    ) -> Result<Pid, SpawnError> {
        self.spawn(name, handle, Ring::Ring3, TaskEntry::User(code))
    }

    fn spawn(
        &mut self,
        name: &str,
        handle: Handle,
        ring: Ring,
        entry: TaskEntry,
    ) -> Result<Pid, SpawnError> {
        let pid = self.next_pid;
        let task = Task::new(pid, name, handle, ring, entry, &mut self.gdt, self.mm.as_mut())?;
        self.next_pid += 1;

        crate::serial_println!("[TASK] task {} ({}) spawned @ {:#x}", pid, name, task.tss.eip);

        if pid != IDLE_PID {
            // Head insertion; the rotation order takes it from there.
            self.runqueue.push_front(pid);
            self.nprocess += 1;
        }
        self.tasks.insert(pid, task);
        Ok(pid)
    }

    /// Runs a wake pass and picks the next task. Returns true when the
    /// caller must complete the change with [`switch_now`](Self::switch_now).
    pub fn schedule(&mut self) -> bool {
        // The first entry ever lands on the idle task, establishing a known
        // place to resume.
        if self.current.is_none() {
            return self.context_switch(IDLE_PID);
        }

        self.wake_pass();

        // Rotate head to tail and take the first Runnable or Running head.
        // One full cycle without a hit means nothing wants to run.
        let rotations = self.runqueue.len();
        for _ in 0..rotations {
            if let Some(head) = self.runqueue.pop_front() {
                self.runqueue.push_back(head);
            }
            let head = self.runqueue[0];
            match self.tasks[&head].state() {
                TaskState::Runnable | TaskState::Running => {
                    return self.context_switch(head);
                }
                _ => {}
            }
        }

        self.context_switch(IDLE_PID)
    }

    /// Transitions blocked tasks whose wake predicate holds, in runqueue
    /// order. A send whose peer parks later in the same pass is caught on
    /// the next one.
    fn wake_pass(&mut self) {
        let order: Vec<Pid> = self.runqueue.iter().copied().collect();
        for pid in order {
            let wake = match self.tasks.get(&pid) {
                None => false,
                Some(task) => match task.state() {
                    TaskState::BlockedReceive => task.mailbox.has_pending_input(),
                    TaskState::BlockedSend => match task.mailbox.dst {
                        Some(dst) => self
                            .task_by_handle(dst)
                            .map(|peer| {
                                peer.state() == TaskState::BlockedReceive
                                    && peer.mailbox.accepts_message_from(task.handle())
                            })
                            .unwrap_or(false),
                        None => false,
                    },
                    TaskState::BlockedSleep => task.wakeup_time() <= self.uptime,
                    _ => false,
                },
            };

            if wake {
                self.unblock(pid);
            }
        }
    }

    fn unblock(&mut self, pid: Pid) {
        if let Some(task) = self.tasks.get_mut(&pid) {
            assert!(task.state().is_blocked());
            task.set_state(TaskState::Runnable);
            self.nblocked -= 1;
        }
    }

    /// Installs `pid` as the running task. Returns false when it already is
    /// (the quantum is still refreshed).
    fn context_switch(&mut self, pid: Pid) -> bool {
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.set_ticks_left(QUANTUM);
        }
        if self.current == Some(pid) {
            // Re-selected without a switch. The task may have been woken in
            // the same pass it blocked in, so re-mark it Running.
            if let Some(task) = self.tasks.get_mut(&pid) {
                task.set_state(TaskState::Running);
            }
            return false;
        }

        {
            let task = &self.tasks[&pid];
            assert_eq!(task.tss.cs & 3, task.tss.ss & 3);
        }

        let previous = self.current;
        if let Some(prev_pid) = previous {
            if let Some(prev) = self.tasks.get_mut(&prev_pid) {
                // A task that blocked keeps its blocked state; one preempted
                // mid-run goes back to Runnable.
                if prev.state() == TaskState::Running {
                    prev.set_state(TaskState::Runnable);
                }
            }
            if let Some(prev) = self.tasks.get(&prev_pid) {
                if !self.mm.unmap_regions_for(prev) {
                    panic!("[SCHED] failed to unmap regions of task {}", prev_pid);
                }
            }
        }

        {
            let task = &self.tasks[&pid];
            if !self.mm.map_regions_for(task) {
                panic!("[SCHED] failed to map regions of task {}", pid);
            }
        }

        self.current = Some(pid);
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.set_state(TaskState::Running);
        }

        self.ensure_selector(pid);

        // Previous descriptor goes back to available before the incoming
        // one is written busy.
        if let Some(prev_selector) = previous
            .and_then(|prev_pid| self.tasks.get(&prev_pid))
            .and_then(|prev| prev.selector())
        {
            self.gdt
                .entry_mut(prev_selector)
                .set_type(gdt::TYPE_TSS_AVAILABLE);
        }
        self.write_tss_descriptor(pid, gdt::TYPE_TSS_BUSY);
        self.cpu.flush_gdt(&self.gdt);

        true
    }

    fn ensure_selector(&mut self, pid: Pid) {
        if self.tasks[&pid].selector().is_some() {
            return;
        }
        let selector = match self.gdt.allocate_slot() {
            Some(selector) => selector,
            None => panic!("[SCHED] GDT exhausted allocating a TSS slot for task {}", pid),
        };
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.set_selector(selector);
        }
    }

    fn write_tss_descriptor(&mut self, pid: Pid, descriptor_type: u8) {
        let (selector, base) = {
            let task = &self.tasks[&pid];
            let selector = match task.selector() {
                Some(selector) => selector,
                None => panic!("[SCHED] task {} has no TSS selector", pid),
            };
            (selector, &task.tss as *const Tss as usize as u32)
        };

        let descriptor = self.gdt.entry_mut(selector);
        descriptor.set_base(base);
        descriptor.set_limit(0xFFFF);
        descriptor.set_dpl(0);
        descriptor.set_present(true);
        descriptor.set_granularity(true);
        descriptor.set_operation_size(true);
        descriptor.set_descriptor_type(false);
        descriptor.set_type(descriptor_type);
    }

    /// Far-jumps to the selected task. On hardware, control leaves here and
    /// comes back only when the outgoing task is scheduled again.
    pub fn switch_now(&mut self) {
        let pid = match self.current {
            Some(pid) => pid,
            None => panic!("[SCHED] switch with no current task"),
        };
        let (selector, far_ptr) = {
            let task = &self.tasks[&pid];
            match task.selector() {
                Some(selector) => (selector, task.far_ptr()),
                None => panic!("[SCHED] task {} switched without a selector", pid),
            }
        };
        self.cpu.task_switch(&mut self.gdt, selector, far_ptr);
    }

    /// Voluntarily enters the scheduler; far-jumps when selection picked a
    /// different task, otherwise returns with interrupts restored.
    pub fn yield_now(&mut self) {
        let _guard = InterruptGuard::hold();
        if self.schedule() {
            self.switch_now();
        }
    }

    /// Marks the running task blocked. Does not yield by itself.
    pub fn block(&mut self, state: TaskState) {
        assert!(state.is_blocked());
        let pid = match self.current {
            Some(pid) => pid,
            None => panic!("[SCHED] block with no current task"),
        };
        let task = match self.tasks.get_mut(&pid) {
            Some(task) => task,
            None => panic!("[SCHED] current task {} missing", pid),
        };
        assert_eq!(task.state(), TaskState::Running);
        task.set_state(state);
        self.nblocked += 1;
    }

    /// Parks the current task until `uptime` reaches now + `ticks`.
    pub fn sleep(&mut self, ticks: u64) {
        let _guard = InterruptGuard::hold();
        let wakeup = self.uptime + ticks;
        let pid = match self.current {
            Some(pid) => pid,
            None => panic!("[SCHED] sleep with no current task"),
        };
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.set_wakeup_time(wakeup);
        }
        self.block(TaskState::BlockedSleep);
        self.yield_now();
    }

    /// Blocking send: parks the message and waits for the destination to be
    /// ready to receive, then deposits it.
    pub fn send(&mut self, dst: Handle, message: Message) {
        let _guard = InterruptGuard::hold();
        let pid = match self.current {
            Some(pid) => pid,
            None => panic!("[SCHED] send with no current task"),
        };
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.mailbox.dst = Some(dst);
            task.mailbox.slot = Some(message);
        }
        self.block(TaskState::BlockedSend);
        self.yield_now();
        self.finish_send();
    }

    /// Second half of a send, running as the sender after the rendezvous
    /// woke it: move the parked message into the peer's slot.
    pub(crate) fn finish_send(&mut self) {
        let Some(pid) = self.current else { return };
        let (dst, message) = match self.tasks.get_mut(&pid) {
            Some(task) => (task.mailbox.dst.take(), task.mailbox.slot.take()),
            None => return,
        };
        let (Some(dst), Some(message)) = (dst, message) else { return };

        // The peer may have terminated while we were parked; the message is
        // dropped in that case.
        if let Some(peer_pid) = self.pid_by_handle(dst) {
            if let Some(peer) = self.tasks.get_mut(&peer_pid) {
                peer.mailbox.slot = Some(message);
            }
        }
    }

    /// Blocking receive. Returns the pending message, or None when the wake
    /// came from a notification bit alone.
    pub fn receive(&mut self, filter: SourceFilter) -> Option<Message> {
        let _guard = InterruptGuard::hold();
        let pid = match self.current {
            Some(pid) => pid,
            None => panic!("[SCHED] receive with no current task"),
        };
        let parked = match self.tasks.get_mut(&pid) {
            Some(task) => {
                task.mailbox.src = filter;
                !task.mailbox.has_pending_input()
            }
            None => return None,
        };

        if parked {
            self.block(TaskState::BlockedReceive);
            self.yield_now();
        }

        self.tasks.get_mut(&pid)?.mailbox.take_message()
    }

    /// ORs notification bits into the target's mailbox; the wake pass does
    /// the rest. Unknown handles are ignored.
    pub fn notify(&mut self, handle: Handle, bits: Notify) {
        if let Some(pid) = self.pid_by_handle(handle) {
            if let Some(task) = self.tasks.get_mut(&pid) {
                task.mailbox.notifies |= bits;
            }
        }
    }

    /// Timer IRQ hook: advances uptime and preempts when the quantum drains.
    pub fn timer_tick(&mut self) {
        self.uptime += 1;

        let Some(pid) = self.current else { return };
        let expired = match self.tasks.get_mut(&pid) {
            Some(task) => {
                let remaining = task.ticks_left().saturating_sub(1);
                task.set_ticks_left(remaining);
                remaining == 0
            }
            None => false,
        };

        if expired {
            self.yield_now();
        }
    }

    /// Terminates the current task. On hardware the far jump to the
    /// successor never returns here.
    pub fn exit_current(&mut self, status: i32) {
        let _guard = InterruptGuard::hold();
        if let Some(task) = self.current.and_then(|pid| self.tasks.get(&pid)) {
            crate::serial_println!(
                "[TASK] {} ({}) exiting with status {}",
                task.name(),
                task.pid(),
                status
            );
        }
        self.teardown_current(TaskState::Exiting);
    }

    /// Fault-handler path: same teardown as exit, different label.
    pub fn task_did_crash(&mut self) {
        let _guard = InterruptGuard::hold();
        if let Some(task) = self.current.and_then(|pid| self.tasks.get(&pid)) {
            crate::serial_println!("[TASK] {} ({}) crashed", task.name(), task.pid());
        }
        self.teardown_current(TaskState::Crashing);
    }

    fn teardown_current(&mut self, state: TaskState) {
        let pid = match self.current {
            Some(pid) => pid,
            None => panic!("[SCHED] teardown with no current task"),
        };
        assert_ne!(pid, IDLE_PID);

        if let Some(task) = self.tasks.get_mut(&pid) {
            task.set_state(state);
        }
        if let Some(task) = self.tasks.get(&pid) {
            task.dump_regions();
        }
        self.runqueue.retain(|&queued| queued != pid);

        // Selection can no longer land on us: not queued, not Runnable.
        if !self.schedule() {
            panic!("[SCHED] failed to schedule a successor for task {}", pid);
        }

        // Regions drop here and release their zones. The kernel stack is
        // the one we are still executing on, so it leaks (see KernelStack).
        if let Some(task) = self.tasks.remove(&pid) {
            self.nprocess -= 1;
            drop(task);
        }

        self.switch_now();
    }

    fn task_by_handle(&self, handle: Handle) -> Option<&Task> {
        self.runqueue
            .iter()
            .filter_map(|pid| self.tasks.get(pid))
            .find(|task| task.handle() == handle)
            .map(|task| &**task)
    }

    fn pid_by_handle(&self, handle: Handle) -> Option<Pid> {
        self.task_by_handle(handle).map(|task| task.pid())
    }

    pub fn current_pid(&self) -> Option<Pid> {
        self.current
    }

    pub fn current_task_mut(&mut self) -> Option<&mut Task> {
        let pid = self.current?;
        self.tasks.get_mut(&pid).map(|task| &mut **task)
    }

    pub fn task(&self, pid: Pid) -> Option<&Task> {
        self.tasks.get(&pid).map(|task| &**task)
    }

    pub fn task_mut(&mut self, pid: Pid) -> Option<&mut Task> {
        self.tasks.get_mut(&pid).map(|task| &mut **task)
    }

    pub fn uptime(&self) -> u64 {
        self.uptime
    }

    /// Live tasks, idle excluded.
    pub fn live_tasks(&self) -> u32 {
        self.nprocess
    }

    pub fn blocked_tasks(&self) -> u32 {
        self.nblocked
    }

    pub fn runqueue(&self) -> impl Iterator<Item = Pid> + '_ {
        self.runqueue.iter().copied()
    }

    pub fn pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.tasks.keys().copied()
    }

    pub fn gdt(&self) -> &Gdt {
        &self.gdt
    }
}

#[cfg(target_arch = "x86")]
mod global {
    use super::Scheduler;
    use crate::arch::X86Cpu;
    use crate::mem::manager::KernelMemoryManager;
    use crate::sync::InterruptGuard;
    use alloc::boxed::Box;

    // Uniprocessor kernel: every access runs with interrupts disabled.
    static mut SCHEDULER: Option<Scheduler> = None;

    /// Installs the boot scheduler over the real CPU and memory manager.
    #[allow(static_mut_refs)]
    pub fn init(mm: KernelMemoryManager) {
        let _guard = InterruptGuard::hold();
        unsafe {
            SCHEDULER = Some(Scheduler::new(Box::new(X86Cpu), Box::new(mm)));
        }
    }

    #[allow(static_mut_refs)]
    pub fn the() -> &'static mut Scheduler {
        unsafe {
            match SCHEDULER.as_mut() {
                Some(scheduler) => scheduler,
                None => panic!("[SCHED] scheduler used before init"),
            }
        }
    }

    /// Timer IRQ hook.
    pub fn on_timer_tick() {
        the().timer_tick();
    }

    /// Exception-handler hook: the current task took an unrecoverable fault.
    pub fn current_task_crashed() {
        the().task_did_crash();
    }
}

#[cfg(target_arch = "x86")]
pub use global::{current_task_crashed, init, on_timer_tick, the};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixture;
    use alloc::sync::Arc;
    use alloc::vec;

    fn spin_task() -> ! {
        loop {
            core::hint::spin_loop();
        }
    }

    const USER_CODE: [u8; 4] = [0xEB, 0xFE, 0x90, 0x90];

    fn check_invariants(sched: &Scheduler) {
        // Exactly one Running task, and it is `current`.
        let running: Vec<Pid> = sched
            .pids()
            .filter(|&pid| sched.task(pid).map(|t| t.state()) == Some(TaskState::Running))
            .collect();
        match sched.current_pid() {
            Some(current) => assert_eq!(running, vec![current]),
            None => assert!(running.is_empty()),
        }

        // Runqueue membership: non-idle tasks exactly once, idle never.
        let queue: Vec<Pid> = sched.runqueue().collect();
        assert!(!queue.contains(&IDLE_PID));
        for pid in sched.pids() {
            if pid != IDLE_PID {
                assert_eq!(queue.iter().filter(|&&queued| queued == pid).count(), 1);
            }
        }

        // No two live tasks share a TSS or LDT selector.
        let mut seen: Vec<u16> = Vec::new();
        for pid in sched.pids() {
            let task = sched.task(pid).unwrap();
            for selector in [task.selector(), task.ldt_selector()].into_iter().flatten() {
                assert!(!seen.contains(&selector.raw()), "selector reused");
                seen.push(selector.raw());
            }
        }
    }

    #[test]
    fn boot_switches_to_idle() {
        let (mut sched, cpu, _mm) = fixture();

        assert_eq!(sched.current_pid(), None);
        assert_eq!(cpu.lock().task_register, Some(sched.task(IDLE_PID).unwrap().selector().unwrap().raw()));

        sched.yield_now();

        assert_eq!(sched.current_pid(), Some(IDLE_PID));
        assert_eq!(sched.task(IDLE_PID).unwrap().state(), TaskState::Running);
        assert_eq!(sched.task(IDLE_PID).unwrap().name(), "colonel");
        assert_eq!(sched.uptime(), 0);
        assert_eq!(cpu.lock().switches.len(), 1);
        check_invariants(&sched);
    }

    #[test]
    fn spawned_user_task_runs_with_regions_mapped() {
        let (mut sched, _cpu, mm) = fixture();
        sched.yield_now();

        let t1 = sched
            .spawn_user_task("u1", Handle(1), USER_CODE.as_ptr())
            .unwrap();
        sched.yield_now();

        assert_eq!(sched.current_pid(), Some(t1));
        assert!(mm.lock().mapped.contains(&t1));
        assert!(mm.lock().unmapped.contains(&IDLE_PID));
        assert_eq!(mm.lock().copies, 1);

        // The live TSS descriptor is marked busy.
        let selector = sched.task(t1).unwrap().selector().unwrap();
        assert_eq!(sched.gdt().entry(selector).type_bits(), gdt::TYPE_TSS_BUSY);
        assert_eq!(sched.task(t1).unwrap().ticks_left(), QUANTUM);
        check_invariants(&sched);
    }

    #[test]
    fn sleep_blocks_until_deadline() {
        let (mut sched, _cpu, _mm) = fixture();
        sched.yield_now();
        let t1 = sched.spawn_kernel_task("t1", Handle(1), spin_task).unwrap();
        sched.yield_now();
        assert_eq!(sched.current_pid(), Some(t1));

        for _ in 0..10 {
            sched.timer_tick();
        }
        assert_eq!(sched.uptime(), 10);
        assert_eq!(sched.current_pid(), Some(t1));

        sched.sleep(3);

        let task = sched.task(t1).unwrap();
        assert_eq!(task.state(), TaskState::BlockedSleep);
        assert_eq!(task.wakeup_time(), 13);
        assert_eq!(sched.current_pid(), Some(IDLE_PID));
        assert_eq!(sched.blocked_tasks(), 1);

        // Not due yet: stays parked.
        sched.timer_tick();
        sched.timer_tick();
        sched.yield_now();
        assert_eq!(sched.task(t1).unwrap().state(), TaskState::BlockedSleep);

        // Deadline reached: one scheduling pass wakes and runs it.
        sched.timer_tick();
        assert_eq!(sched.uptime(), 13);
        sched.yield_now();
        assert_eq!(sched.task(t1).unwrap().state(), TaskState::Running);
        assert_eq!(sched.current_pid(), Some(t1));
        assert_eq!(sched.blocked_tasks(), 0);
        check_invariants(&sched);
    }

    #[test]
    fn rendezvous_delivers_across_blocked_peers() {
        let (mut sched, _cpu, _mm) = fixture();
        sched.yield_now();

        let t1 = sched.spawn_kernel_task("rx", Handle(11), spin_task).unwrap();
        sched.yield_now();
        assert_eq!(sched.current_pid(), Some(t1));

        // The receiver parks with an open filter.
        let early = sched.receive(SourceFilter::Any);
        assert!(early.is_none());
        assert_eq!(sched.task(t1).unwrap().state(), TaskState::BlockedReceive);
        assert_eq!(sched.current_pid(), Some(IDLE_PID));

        let t2 = sched.spawn_kernel_task("tx", Handle(22), spin_task).unwrap();
        sched.yield_now();
        assert_eq!(sched.current_pid(), Some(t2));

        // The wake pass inside the send's yield sees the parked receiver,
        // unblocks the sender, and the send completes.
        sched.send(Handle(11), Message::new(7, Handle(22), vec![1, 2]));

        assert_eq!(sched.current_pid(), Some(t2));
        assert_eq!(sched.task(t2).unwrap().state(), TaskState::Running);
        let receiver = sched.task(t1).unwrap();
        assert!(receiver.mailbox.slot.is_some());

        // Next pass wakes the receiver, which takes the message.
        sched.yield_now();
        assert_ne!(sched.task(t1).unwrap().state(), TaskState::BlockedReceive);
        let message = sched.task_mut(t1).unwrap().mailbox.take_message().unwrap();
        assert_eq!(message.kind, 7);
        assert_eq!(message.sender, Handle(22));
        assert_eq!(message.data, vec![1, 2]);
        assert_eq!(sched.blocked_tasks(), 0);
        check_invariants(&sched);
    }

    #[test]
    fn sender_to_absent_peer_stays_blocked() {
        let (mut sched, _cpu, _mm) = fixture();
        sched.yield_now();
        let t1 = sched.spawn_kernel_task("tx", Handle(5), spin_task).unwrap();
        sched.yield_now();

        sched.send(Handle(999), Message::new(1, Handle(5), vec![]));

        // No such destination: the sender is parked for good and the
        // scheduler fell back to idle.
        assert_eq!(sched.task(t1).unwrap().state(), TaskState::BlockedSend);
        assert_eq!(sched.current_pid(), Some(IDLE_PID));
        check_invariants(&sched);
    }

    #[test]
    fn sender_unblocks_only_after_peer_parks() {
        let (mut sched, _cpu, _mm) = fixture();
        sched.yield_now();

        let rx = sched.spawn_kernel_task("rx", Handle(1), spin_task).unwrap();
        let tx = sched.spawn_kernel_task("tx", Handle(2), spin_task).unwrap();

        // Run the sender and let it park: the receiver is Runnable, not
        // receiving, so the send predicate fails and the sender waits.
        sched.yield_now();
        while sched.current_pid() != Some(tx) {
            sched.yield_now();
        }
        sched.send(Handle(1), Message::new(9, Handle(2), vec![]));
        assert_eq!(sched.task(tx).unwrap().state(), TaskState::BlockedSend);

        // Now run the receiver until it parks too.
        while sched.current_pid() != Some(rx) {
            sched.yield_now();
        }
        let _ = sched.receive(SourceFilter::Exactly(Handle(2)));
        assert_eq!(sched.task(rx).unwrap().state(), TaskState::BlockedReceive);

        // The following pass wakes the sender.
        sched.yield_now();
        assert_ne!(sched.task(tx).unwrap().state(), TaskState::BlockedSend);
        check_invariants(&sched);
    }

    #[test]
    fn notify_bits_wake_a_receiver() {
        let (mut sched, _cpu, _mm) = fixture();
        sched.yield_now();
        let t1 = sched.spawn_kernel_task("rx", Handle(4), spin_task).unwrap();
        sched.yield_now();

        let got = sched.receive(SourceFilter::Any);
        assert!(got.is_none());
        assert_eq!(sched.task(t1).unwrap().state(), TaskState::BlockedReceive);

        sched.notify(Handle(4), Notify::KEYBOARD);
        sched.yield_now();

        assert_eq!(sched.current_pid(), Some(t1));
        assert_eq!(sched.task(t1).unwrap().state(), TaskState::Running);
        check_invariants(&sched);
    }

    #[test]
    fn exit_releases_zones_and_runqueue_slot() {
        let (mut sched, cpu, mm) = fixture();
        sched.yield_now();

        let t1 = sched
            .spawn_user_task("dying", Handle(9), USER_CODE.as_ptr())
            .unwrap();
        sched.yield_now();
        assert_eq!(sched.current_pid(), Some(t1));
        assert_eq!(sched.live_tasks(), 1);

        let zone = sched.task(t1).unwrap().regions()[0].zone().clone();
        assert_eq!(Arc::strong_count(&zone), 2);
        let dead_selector = sched.task(t1).unwrap().selector().unwrap();

        sched.exit_current(0);

        assert_eq!(sched.live_tasks(), 0);
        assert!(sched.task(t1).is_none());
        assert!(sched.runqueue().all(|pid| pid != t1));
        assert_eq!(Arc::strong_count(&zone), 1);
        assert!(mm.lock().unmapped.contains(&t1));

        // The successor took over and the dead selector was not jumped
        // through again.
        assert_eq!(sched.current_pid(), Some(IDLE_PID));
        let last_switch = *cpu.lock().switches.last().unwrap();
        assert_ne!(last_switch, dead_selector.raw());
        check_invariants(&sched);
    }

    #[test]
    fn crash_teardown_matches_exit() {
        let (mut sched, _cpu, _mm) = fixture();
        sched.yield_now();
        let t1 = sched.spawn_kernel_task("bad", Handle(3), spin_task).unwrap();
        sched.yield_now();
        assert_eq!(sched.current_pid(), Some(t1));

        sched.task_did_crash();

        assert!(sched.task(t1).is_none());
        assert_eq!(sched.current_pid(), Some(IDLE_PID));
        assert_eq!(sched.live_tasks(), 0);
        check_invariants(&sched);
    }

    #[test]
    fn round_robin_splits_ticks_evenly() {
        let (mut sched, _cpu, _mm) = fixture();

        let t1 = sched.spawn_kernel_task("t1", Handle(1), spin_task).unwrap();
        let t2 = sched.spawn_kernel_task("t2", Handle(2), spin_task).unwrap();
        let t3 = sched.spawn_kernel_task("t3", Handle(3), spin_task).unwrap();

        sched.yield_now(); // boot: idle
        sched.yield_now(); // first worker

        let mut counts: BTreeMap<Pid, u32> = BTreeMap::new();
        for _ in 0..30 {
            let running = sched.current_pid().unwrap();
            sched.timer_tick();
            *counts.entry(running).or_insert(0) += 1;
        }

        // Two full quanta apiece, nothing for idle.
        assert_eq!(counts.get(&t1), Some(&10));
        assert_eq!(counts.get(&t2), Some(&10));
        assert_eq!(counts.get(&t3), Some(&10));
        assert_eq!(counts.get(&IDLE_PID), None);

        // Quantum was refilled on the switch that just happened.
        let running = sched.current_pid().unwrap();
        assert_eq!(sched.task(running).unwrap().ticks_left(), QUANTUM);
        check_invariants(&sched);
    }

    #[test]
    fn preempted_task_goes_back_to_runnable() {
        let (mut sched, _cpu, _mm) = fixture();
        sched.yield_now();
        let t1 = sched.spawn_kernel_task("t1", Handle(1), spin_task).unwrap();
        let t2 = sched.spawn_kernel_task("t2", Handle(2), spin_task).unwrap();
        sched.yield_now();

        let first = sched.current_pid().unwrap();
        sched.yield_now();
        let second = sched.current_pid().unwrap();

        assert_ne!(first, second);
        assert!(first == t1 || first == t2);
        assert_eq!(sched.task(first).unwrap().state(), TaskState::Runnable);
        assert_eq!(sched.task(second).unwrap().state(), TaskState::Running);
        check_invariants(&sched);
    }

    #[test]
    #[should_panic]
    fn block_outside_a_running_task_panics() {
        let (mut sched, _cpu, _mm) = fixture();
        // No current task yet.
        sched.block(TaskState::BlockedSleep);
    }

    #[test]
    fn spawn_failure_reports_out_of_memory() {
        use crate::testing::{FailingMemoryManager, FakeCpu};
        use alloc::boxed::Box;

        let (cpu, _log) = FakeCpu::new();
        // Zone allocation succeeds during boot (idle needs none), then fails.
        let mut sched = Scheduler::new(Box::new(cpu), Box::new(FailingMemoryManager));

        let err = sched
            .spawn_user_task("nomem", Handle(1), USER_CODE.as_ptr())
            .unwrap_err();
        assert_eq!(err, SpawnError::OutOfMemory);
        assert_eq!(sched.live_tasks(), 0);
    }
}
