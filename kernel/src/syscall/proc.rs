//! Process, time and memory system calls

use super::{into_rax, SyscallGuard, FAILURE};
use crate::error::{KernelError, KernelResult};
use crate::process::{self, FdMask};
use crate::sched::{self, WakeReason};

use super::file::{field_u32, field_u64};

/// SLEEP: block for the given nanoseconds. Cancellable; returns
/// non-zero when a signal cut it short.
pub fn sys_sleep(guard: &SyscallGuard, ns: u64) -> u64 {
    let woken = guard.cancellable(|| {
        if ns == 0 {
            sched::yield_now();
            WakeReason::Unblocked
        } else {
            sched::sleep(ns)
        }
    });
    match woken {
        WakeReason::Unblocked => 0,
        WakeReason::Signal => 1,
    }
}

/// CLOCK: process uptime in nanoseconds.
pub fn sys_clock(guard: &SyscallGuard) -> u64 {
    let begin = guard.process().lock().clock_begin;
    sched::now_ns().saturating_sub(begin)
}

/// EXIT: kill the whole process. Does not return on bare metal; the
/// scheduler reaps the threads at their next dispatch.
pub fn sys_exit(guard: &SyscallGuard, status: i32) -> u64 {
    let pid = guard.process().lock().pid;
    let _ = sched::kill_process(pid, status);

    #[cfg(target_os = "none")]
    {
        sched::yield_now();
        unreachable!("exited process resumed");
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

/// SBRK: move the break by a signed delta; returns the previous break.
pub fn sys_sbrk(guard: &SyscallGuard, delta: i64) -> u64 {
    into_rax(guard.process().lock().sbrk(delta))
}

/// EXEC: spawn a new process from an ELF image. The replace-self mode
/// (flag 0) is not supported and fails cleanly.
pub fn sys_exec(guard: &SyscallGuard, args: &[u8]) -> u64 {
    let parsed = (|| {
        let image_ptr = field_u64(args, 0)?;
        let image_len = field_u64(args, 8)?;
        let argv_ptr = field_u64(args, 16)?;
        let argv_len = field_u64(args, 24)?;
        let envp_ptr = field_u64(args, 32)?;
        let envp_len = field_u64(args, 40)?;
        let new_process = field_u32(args, 48)?;
        let fd_mask = field_u32(args, 52)?;

        let proc = guard.process().lock();
        proc.validate_range(image_ptr, image_len)?;
        if argv_len != 0 {
            proc.validate_range(argv_ptr, argv_len)?;
        }
        if envp_len != 0 {
            proc.validate_range(envp_ptr, envp_len)?;
        }
        Ok::<_, KernelError>((
            image_ptr,
            image_len,
            argv_ptr,
            argv_len,
            envp_ptr,
            envp_len,
            new_process,
            fd_mask,
        ))
    })();
    let Ok((image_ptr, image_len, argv_ptr, argv_len, envp_ptr, envp_len, new_process, fd_mask)) =
        parsed
    else {
        return FAILURE;
    };

    if new_process == 0 {
        // UNIX-style replacement is out of contract.
        return FAILURE;
    }

    #[cfg(target_os = "none")]
    {
        // Copy everything out of the caller's address space first: the
        // spawn switches page maps and the user pointers die with it.
        let copy = |ptr: u64, len: u64| -> alloc::vec::Vec<u8> {
            if len == 0 {
                alloc::vec::Vec::new()
            } else {
                unsafe { core::slice::from_raw_parts(ptr as *const u8, len as usize) }.to_vec()
            }
        };
        let image = copy(image_ptr, image_len);
        let argv = copy(argv_ptr, argv_len);
        let envp = copy(envp_ptr, envp_len);
        into_rax(do_exec(guard, &image, &argv, &envp, fd_mask))
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = (image_ptr, image_len, argv_ptr, argv_len, envp_ptr, envp_len, fd_mask);
        FAILURE
    }
}

/// Spawn: build the child, marshal its entry arguments, launch its
/// first thread. Returns the child pid.
///
/// Creation leaves the child's address space active (its stack needs
/// populating); the caller's map is put back before returning.
pub fn do_exec(
    guard: &SyscallGuard,
    image: &[u8],
    argv: &[u8],
    envp: &[u8],
    fd_mask: FdMask,
) -> KernelResult<u64> {
    #[cfg(target_os = "none")]
    let parent_map = crate::mm::paging::user_page_map();

    let result = (|| {
        let child_pid = process::create_process(image, guard.process(), fd_mask)?;
        let child = process::table::get(child_pid).ok_or(KernelError::NotFound)?;
        {
            let mut child = child.lock();
            process::set_entry_arguments(&mut child, argv, envp)?;
        }
        Ok(child_pid)
    })();

    #[cfg(target_os = "none")]
    unsafe {
        crate::mm::paging::set_user_page_map(parent_map);
    }

    let child_pid = result?;
    sched::launch(child_pid, process::FIRST_TID);
    Ok(child_pid as u64)
}

/// THREAD_CREATE: a new thread at `entry(argument)`.
pub fn sys_thread_create(guard: &SyscallGuard, args: &[u8]) -> u64 {
    let parsed = (|| {
        let entry = field_u64(args, 0)?;
        let argument = field_u64(args, 8)?;
        Ok::<_, KernelError>((entry, argument))
    })();
    match parsed {
        Ok((entry, argument)) => into_rax(do_thread_create(guard, entry, argument)),
        Err(_) => FAILURE,
    }
}

pub fn do_thread_create(guard: &SyscallGuard, entry: u64, argument: u64) -> KernelResult<u64> {
    if !crate::mm::vmap::is_user(entry) {
        return Err(KernelError::BadAddress { addr: entry });
    }
    let (pid, tid) = {
        let mut proc = guard.process().lock();
        let tid = process::create_thread(&mut proc, entry, argument)?;
        (proc.pid, tid)
    };
    sched::launch(pid, tid);
    Ok(tid as u64)
}

/// GETPID.
pub fn sys_getpid(guard: &SyscallGuard) -> u64 {
    guard.process().lock().pid as u64
}

/// GETPPID.
pub fn sys_getppid(guard: &SyscallGuard) -> u64 {
    guard.process().lock().ppid as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::table;
    use crate::syscall::tests::test_process;
    use crate::syscall::SyscallGuard;

    #[test]
    fn sbrk_scenario_grow_shrink() {
        let (process, tid) = test_process();
        {
            let mut p = process.lock();
            p.heap_begin = 0x4000;
            p.brk = 0x4000;
            p.unaligned_brk = 0x4000;
        }
        let guard = SyscallGuard::enter(process.clone(), tid, 0).unwrap();

        assert_eq!(sys_sbrk(&guard, 0x2000), 0x4000);
        assert_eq!(process.lock().brk, 0x6000);

        assert_eq!(sys_sbrk(&guard, -0x1000), 0x6000);
        assert_eq!(process.lock().brk, 0x5000);

        // A read from the freed page now fails validation, which is
        // what turns into SIGSEGV on the fault path.
        assert!(process.lock().validate_range(0x5000, 8).is_err());
        assert!(process.lock().validate_range(0x4000, 0x1000).is_ok());

        // Failed sbrk leaves the break alone.
        assert_eq!(sys_sbrk(&guard, i64::MIN + 1), super::FAILURE);
        assert_eq!(process.lock().brk, 0x5000);

        drop(guard);
        let pid = process.lock().pid;
        table::remove(pid);
    }

    #[test]
    fn clock_measures_uptime() {
        let (process, tid) = test_process();
        let guard = SyscallGuard::enter(process.clone(), tid, 0).unwrap();

        let before = sys_clock(&guard);
        crate::sched::timer_tick();
        let after = sys_clock(&guard);
        assert!(after >= before + crate::sched::NS_PER_TICK);

        drop(guard);
        let pid = process.lock().pid;
        table::remove(pid);
    }

    #[test]
    fn exit_marks_every_thread() {
        let (process, tid) = test_process();
        let guard = SyscallGuard::enter(process.clone(), tid, 0).unwrap();

        assert_eq!(sys_exit(&guard, 7), 0);
        {
            let p = process.lock();
            assert!(p.threads.iter().all(|t| t.should_exit));
            assert!(p.threads.iter().all(|t| t.exit_status == 7));
        }

        drop(guard);
        let pid = process.lock().pid;
        table::remove(pid);
    }

    #[test]
    fn thread_create_rejects_kernel_entry() {
        let (process, tid) = test_process();
        let guard = SyscallGuard::enter(process.clone(), tid, 0).unwrap();

        assert!(do_thread_create(&guard, 0xffff_ffff_8000_0000, 0).is_err());
        let new_tid = do_thread_create(&guard, 0x40_2000, 0xabc).unwrap();
        assert_eq!(new_tid, 2);
        {
            let p = process.lock();
            let t = p.thread(2).unwrap();
            assert_eq!(t.context.rip, 0x40_2000);
            assert_eq!(t.context.rdi, 0xabc);
        }

        drop(guard);
        let pid = process.lock().pid;
        crate::sched::purge_ready(pid);
        table::remove(pid);
    }

    #[test]
    fn spawn_creates_scheduled_child() {
        let (process, tid) = test_process();
        let guard = SyscallGuard::enter(process.clone(), tid, 0).unwrap();

        let image = crate::elf::build_test_image(0x40_1000, 0x40_0000, b"payload");
        let argv = process::marshal_strings(&["child", "x"]);
        let envp = process::marshal_strings(&[]);
        let child_pid = do_exec(&guard, &image, &argv, &envp, 0).unwrap() as crate::process::Pid;

        let child = table::get(child_pid).unwrap();
        {
            let c = child.lock();
            assert_eq!(c.ppid, process.lock().pid);
            assert_eq!(c.thread(1).unwrap().context.rdi, 2); // argc
        }

        drop(guard);
        crate::sched::purge_ready(child_pid);
        child.lock().threads.clear();
        process::free_process(child_pid);
        let pid = process.lock().pid;
        table::remove(pid);
    }
}
