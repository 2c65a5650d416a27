//! Signal system calls

use super::{into_rax, SyscallGuard, FAILURE};
use crate::error::{KernelError, KernelResult};
use crate::process::signal::{self, Disposition, MAX_SIGNALS};
use crate::process::Pid;

use super::file::{field_u32, field_u64};

/// SIGSETUP: register the trampoline and disposition table. Both
/// pointers must lie inside the process image.
pub fn sys_sigsetup(guard: &SyscallGuard, args: &[u8]) -> u64 {
    let parsed = (|| {
        let trampoline = field_u64(args, 0)?;
        let table_ptr = field_u64(args, 8)?;

        let proc = guard.process().lock();
        let program = proc.program.as_ref().ok_or(KernelError::WrongState)?;
        if !program.contains(trampoline, 1) {
            return Err(KernelError::BadAddress { addr: trampoline });
        }
        if !program.contains(table_ptr, (MAX_SIGNALS * 8) as u64) {
            return Err(KernelError::BadAddress { addr: table_ptr });
        }
        Ok::<_, KernelError>((trampoline, table_ptr))
    })();
    let Ok((trampoline, table_ptr)) = parsed else {
        return FAILURE;
    };

    #[cfg(target_os = "none")]
    {
        // The user table has no alignment guarantee; copy bytewise.
        let mut raw = [0u8; MAX_SIGNALS * 8];
        unsafe {
            core::ptr::copy_nonoverlapping(table_ptr as *const u8, raw.as_mut_ptr(), raw.len());
        }
        let mut entries = [0u64; MAX_SIGNALS];
        for (i, slot) in entries.iter_mut().enumerate() {
            *slot = u64::from_ne_bytes(raw[i * 8..i * 8 + 8].try_into().unwrap());
        }
        into_rax(do_sigsetup(guard, trampoline, &entries).map(|_| 0))
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = (trampoline, table_ptr);
        FAILURE
    }
}

/// Install the copied-in table: 0 means ignore, anything else is a
/// handler address.
pub fn do_sigsetup(
    guard: &SyscallGuard,
    trampoline: u64,
    entries: &[u64; MAX_SIGNALS],
) -> KernelResult<()> {
    let mut table = [Disposition::Ignore; MAX_SIGNALS];
    for (slot, &raw) in table.iter_mut().zip(entries.iter()) {
        if raw != 0 {
            *slot = Disposition::Handler(raw);
        }
    }
    guard.process().lock().signals.setup(trampoline, table);
    Ok(())
}

/// SIGRETURN: put the context displaced at signal delivery back into
/// thread 1. `None` tells the exit path the saved context is already
/// final — the return value slot must stay exactly as the interrupted
/// computation left it.
pub fn sys_sigreturn(guard: &SyscallGuard) -> Option<u64> {
    let restored = {
        let mut proc = guard.process().lock();
        signal::end_of_signal(&mut proc)
    };
    match restored {
        Err(_) => Some(FAILURE),
        Ok(_) => None,
    }
}

/// SIGKILL: post a signal to a process.
pub fn sys_sigkill(guard: &SyscallGuard, args: &[u8]) -> u64 {
    let _ = guard;
    let parsed = (|| {
        let pid = field_u32(args, 0)?;
        let sig = field_u32(args, 4)?;
        Ok::<_, KernelError>((pid, sig))
    })();
    match parsed {
        Ok((pid, sig)) => into_rax(do_sigkill(pid as Pid, sig)),
        Err(_) => FAILURE,
    }
}

pub fn do_sigkill(pid: Pid, sig: u32) -> KernelResult<u64> {
    if sig as usize >= MAX_SIGNALS {
        return Err(KernelError::InvalidArgument);
    }
    if pid == crate::process::KERNEL_PID {
        return Err(KernelError::PermissionDenied);
    }
    signal::trigger(pid, sig as u8)?;
    Ok(0)
}

/// SIGPAUSE: block until any signal arms. Cancellable by definition;
/// arming is the only way out.
pub fn sys_sigpause(guard: &SyscallGuard) -> u64 {
    guard.cancellable(crate::sched::pause_for_signal);
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::table;
    use crate::syscall::tests::test_process;
    use crate::syscall::SyscallGuard;

    #[test]
    fn sigsetup_installs_dispositions() {
        let (process, tid) = test_process();
        let guard = SyscallGuard::enter(process.clone(), tid, 0).unwrap();

        let mut entries = [0u64; MAX_SIGNALS];
        entries[15] = 0x40_2000;
        do_sigsetup(&guard, 0x40_3000, &entries).unwrap();

        {
            let p = process.lock();
            assert!(p.signals.installed());
            assert_eq!(p.signals.disposition(15), Disposition::Handler(0x40_2000));
            assert_eq!(p.signals.disposition(14), Disposition::Ignore);
        }

        drop(guard);
        let pid = process.lock().pid;
        table::remove(pid);
    }

    #[test]
    fn kill_then_delivery_at_syscall_exit() {
        let (process, tid) = test_process();
        let pid = process.lock().pid;

        {
            let guard = SyscallGuard::enter(process.clone(), tid, 0x7000_8000).unwrap();
            let mut entries = [0u64; MAX_SIGNALS];
            entries[15] = 0x40_2000;
            do_sigsetup(&guard, 0x40_3000, &entries).unwrap();
            drop(guard);
        }

        // Another process posts the signal while the target thread is
        // not blocked and not in a syscall: immediate preparation.
        do_sigkill(pid, 15).unwrap();
        {
            let p = process.lock();
            assert_eq!(p.signals.current, Some(15));
            assert_eq!(p.thread(tid).unwrap().context.rip, 0x40_2000);
            assert_eq!(p.thread(tid).unwrap().context.rdi, 15);
        }

        table::remove(pid);
    }

    #[test]
    fn sigreturn_resumes_the_displaced_context() {
        let (process, tid) = test_process();
        let rip_before = process.lock().thread(tid).unwrap().context.rip;

        {
            let guard = SyscallGuard::enter(process.clone(), tid, 0x7000_8000).unwrap();
            let mut entries = [0u64; MAX_SIGNALS];
            entries[9] = 0x40_2000;
            do_sigsetup(&guard, 0x40_3000, &entries).unwrap();
            drop(guard);
        }
        let pid = process.lock().pid;
        do_sigkill(pid, 9).unwrap();

        let guard = SyscallGuard::enter(process.clone(), tid, 0x7000_8000).unwrap();
        // None: the restored context is final, rax untouched.
        assert_eq!(sys_sigreturn(&guard), None);
        {
            let p = process.lock();
            assert_eq!(p.signals.current, None);
            assert_eq!(p.thread(tid).unwrap().context.rip, rip_before);
        }
        drop(guard);

        // Outside a handler, sigreturn fails.
        let guard = SyscallGuard::enter(process.clone(), tid, 0).unwrap();
        assert_eq!(sys_sigreturn(&guard), Some(FAILURE));
        drop(guard);

        table::remove(pid);
    }

    #[test]
    fn bad_signal_numbers_and_kernel_pid_are_rejected() {
        assert!(do_sigkill(0, 1).is_err());
        let (process, _tid) = test_process();
        let pid = process.lock().pid;
        assert!(do_sigkill(pid, 64).is_err());
        assert!(do_sigkill(0xfff0, 1).is_err()); // no such pid
        table::remove(pid);
    }
}
