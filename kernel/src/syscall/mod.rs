//! Syscall surface: thin adapters from user requests to task and scheduler
//! operations. Anything that fails returns -1 to the caller; nothing here
//! propagates errors further up.

use crate::task::scheduler::Scheduler;
use crate::task::Task;

/// Syscall numbers (stable ABI)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SyscallNumber {
    Exit = 0,
    Sleep = 1,
    Open = 2,
    Read = 3,
    Close = 4,
    Seek = 5,
    Kill = 6,
    GetUid = 7,
}

impl SyscallNumber {
    pub fn from_raw(raw: u32) -> Option<SyscallNumber> {
        Some(match raw {
            0 => SyscallNumber::Exit,
            1 => SyscallNumber::Sleep,
            2 => SyscallNumber::Open,
            3 => SyscallNumber::Read,
            4 => SyscallNumber::Close,
            5 => SyscallNumber::Seek,
            6 => SyscallNumber::Kill,
            7 => SyscallNumber::GetUid,
            _ => return None,
        })
    }
}

/// Dispatches one syscall on behalf of the current task.
///
/// Pointer arguments are raw addresses in the flat address space; the
/// caller's regions are mapped while it runs, so they are directly
/// readable.
pub fn dispatch(sched: &mut Scheduler, number: u32, arg1: usize, arg2: usize, arg3: usize) -> i32 {
    match SyscallNumber::from_raw(number) {
        Some(SyscallNumber::Exit) => {
            sched.exit_current(arg1 as i32);
            0
        }
        Some(SyscallNumber::Sleep) => {
            sched.sleep(arg1 as u64);
            0
        }
        Some(SyscallNumber::Open) => sys_open(sched, arg1 as *const u8, arg2),
        Some(SyscallNumber::Read) => sys_read(sched, arg1 as i32, arg2 as *mut u8, arg3),
        Some(SyscallNumber::Close) => with_current(sched, |task| task.sys_close(arg1 as i32)),
        Some(SyscallNumber::Seek) => {
            with_current(sched, |task| task.sys_seek(arg1 as i32, arg2 as i32))
        }
        Some(SyscallNumber::Kill) => sys_kill(arg1 as i32, arg2 as i32),
        Some(SyscallNumber::GetUid) => with_current(sched, |task| task.sys_getuid() as i32),
        None => -1,
    }
}

fn with_current<F>(sched: &mut Scheduler, operation: F) -> i32
where
    F: FnOnce(&mut Task) -> i32,
{
    match sched.current_task_mut() {
        Some(task) => operation(task),
        None => -1,
    }
}

fn sys_open(sched: &mut Scheduler, path: *const u8, len: usize) -> i32 {
    if path.is_null() {
        return -1;
    }
    // SAFETY: the caller's regions are mapped while it executes.
    let bytes = unsafe { core::slice::from_raw_parts(path, len) };
    let Ok(path) = core::str::from_utf8(bytes) else {
        return -1;
    };
    with_current(sched, |task| task.sys_open(path))
}

fn sys_read(sched: &mut Scheduler, fd: i32, buf: *mut u8, len: usize) -> i32 {
    if buf.is_null() {
        return -1;
    }
    // SAFETY: see sys_open.
    let buf = unsafe { core::slice::from_raw_parts_mut(buf, len) };
    with_current(sched, |task| task.sys_read(fd, buf))
}

/// Signal delivery is not wired up; every kill fails.
fn sys_kill(_pid: i32, _sig: i32) -> i32 {
    -1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::vfs::{MemFile, VFS};
    use crate::ipc::Handle;
    use crate::task::scheduler::IDLE_PID;
    use crate::task::TaskState;
    use crate::testing::fixture;
    use alloc::sync::Arc;
    use alloc::vec;

    fn spin_task() -> ! {
        loop {
            core::hint::spin_loop();
        }
    }

    #[test]
    fn file_syscalls_round_trip() {
        VFS.lock().register(
            "/syscall-test/motd",
            Arc::new(MemFile::new(vec![b'c', b'i', b'n', b'd', b'e', b'r'])),
        );

        let (mut sched, _cpu, _mm) = fixture();
        sched.yield_now();
        sched.spawn_kernel_task("t", Handle(1), spin_task).unwrap();
        sched.yield_now();

        let path = "/syscall-test/motd";
        let fd = dispatch(
            &mut sched,
            SyscallNumber::Open as u32,
            path.as_ptr() as usize,
            path.len(),
            0,
        );
        assert_eq!(fd, 0);

        let mut buf = [0u8; 4];
        let n = dispatch(
            &mut sched,
            SyscallNumber::Read as u32,
            fd as usize,
            buf.as_mut_ptr() as usize,
            buf.len(),
        );
        assert_eq!(n, 4);
        assert_eq!(&buf, b"cind");

        let pos = dispatch(&mut sched, SyscallNumber::Seek as u32, fd as usize, 4, 0);
        assert_eq!(pos, 4);
        let n = dispatch(
            &mut sched,
            SyscallNumber::Read as u32,
            fd as usize,
            buf.as_mut_ptr() as usize,
            buf.len(),
        );
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], b"er");

        assert_eq!(
            dispatch(&mut sched, SyscallNumber::Close as u32, fd as usize, 0, 0),
            0
        );
        assert_eq!(
            dispatch(
                &mut sched,
                SyscallNumber::Read as u32,
                fd as usize,
                buf.as_mut_ptr() as usize,
                buf.len()
            ),
            -1
        );
    }

    #[test]
    fn open_missing_path_fails() {
        let (mut sched, _cpu, _mm) = fixture();
        sched.yield_now();
        sched.spawn_kernel_task("t", Handle(1), spin_task).unwrap();
        sched.yield_now();

        let path = "/syscall-test/nope";
        let fd = dispatch(
            &mut sched,
            SyscallNumber::Open as u32,
            path.as_ptr() as usize,
            path.len(),
            0,
        );
        assert_eq!(fd, -1);
    }

    #[test]
    fn sleep_syscall_parks_the_caller() {
        let (mut sched, _cpu, _mm) = fixture();
        sched.yield_now();
        let t1 = sched.spawn_kernel_task("t", Handle(1), spin_task).unwrap();
        sched.yield_now();

        assert_eq!(dispatch(&mut sched, SyscallNumber::Sleep as u32, 7, 0, 0), 0);
        assert_eq!(sched.task(t1).unwrap().state(), TaskState::BlockedSleep);
        assert_eq!(sched.task(t1).unwrap().wakeup_time(), 7);
        assert_eq!(sched.current_pid(), Some(IDLE_PID));
    }

    #[test]
    fn exit_syscall_tears_the_caller_down() {
        let (mut sched, _cpu, _mm) = fixture();
        sched.yield_now();
        let t1 = sched.spawn_kernel_task("t", Handle(1), spin_task).unwrap();
        sched.yield_now();

        dispatch(&mut sched, SyscallNumber::Exit as u32, 0, 0, 0);
        assert!(sched.task(t1).is_none());
        assert_eq!(sched.current_pid(), Some(IDLE_PID));
    }

    #[test]
    fn kill_and_unknown_numbers_fail() {
        let (mut sched, _cpu, _mm) = fixture();
        sched.yield_now();
        sched.spawn_kernel_task("t", Handle(1), spin_task).unwrap();
        sched.yield_now();

        assert_eq!(dispatch(&mut sched, SyscallNumber::Kill as u32, 1, 9, 0), -1);
        assert_eq!(dispatch(&mut sched, 999, 0, 0, 0), -1);
        assert_eq!(dispatch(&mut sched, SyscallNumber::GetUid as u32, 0, 0, 0), 0);
    }
}
