//! System call gateway
//!
//! A fast-syscall entry lands on the calling thread's kernel stack,
//! saves the user context, and dispatches through a fixed table of 27
//! numbers. All pointer arguments are validated against the process
//! address space (thread stacks, the heap window, ELF segments) before
//! anything dereferences them; the validator lives on `Process`.
//!
//! Entering a system call is a scoped acquisition: [`SyscallGuard`]
//! records the user stack pointer and marks the thread uninterruptible;
//! dropping it undoes both, re-checks the lazy-exit flag and delivers
//! any pending signal to thread 1. Forgetting the exit bookkeeping on
//! some return path is therefore impossible.
//!
//! The convention is `rax = number, rdi = &args, rsi = args_size`, with
//! every argument packed in a caller-provided struct. Failure is `-1`
//! in `rax`; the gateway is the only translator from `KernelError` to
//! that value.

use crate::error::KernelResult;
use crate::process::{self, ProcessRef, Tid};

mod file;
mod proc;
mod sig;

pub use file::*;
pub use proc::*;
pub use sig::*;

/// The user-visible failure value.
pub const FAILURE: u64 = u64::MAX;

/// System call numbers. The gaps are retired numbers that must never
/// be reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Nr {
    Sleep = 1,
    Clock = 2,
    Exit = 3,
    Open = 4,
    Close = 5,
    Read = 6,
    Write = 7,
    Truncate = 8,
    Seek = 9,
    Access = 10,
    Dup = 11,
    Pipe = 12,
    ThreadCreate = 13,
    Sbrk = 16,
    Exec = 18,
    Chdir = 19,
    Getcwd = 20,
    Getpid = 21,
    Getppid = 22,
    Sigsetup = 23,
    Sigreturn = 24,
    Sigkill = 25,
    Sigpause = 26,
}

impl Nr {
    pub fn from_u64(nr: u64) -> Option<Self> {
        Some(match nr {
            1 => Nr::Sleep,
            2 => Nr::Clock,
            3 => Nr::Exit,
            4 => Nr::Open,
            5 => Nr::Close,
            6 => Nr::Read,
            7 => Nr::Write,
            8 => Nr::Truncate,
            9 => Nr::Seek,
            10 => Nr::Access,
            11 => Nr::Dup,
            12 => Nr::Pipe,
            13 => Nr::ThreadCreate,
            16 => Nr::Sbrk,
            18 => Nr::Exec,
            19 => Nr::Chdir,
            20 => Nr::Getcwd,
            21 => Nr::Getpid,
            22 => Nr::Getppid,
            23 => Nr::Sigsetup,
            24 => Nr::Sigreturn,
            25 => Nr::Sigkill,
            26 => Nr::Sigpause,
            _ => return None,
        })
    }
}

/// Fold a handler result into the `rax` convention.
pub fn into_rax(result: KernelResult<u64>) -> u64 {
    match result {
        Ok(v) => v,
        Err(e) => {
            log::debug!("syscall failed: {e}");
            FAILURE
        }
    }
}

/// The in-syscall state of the current thread, acquired at entry.
///
/// While the guard lives the thread is uninterruptible and its user
/// stack pointer is on record for signal delivery. Dropping the guard
/// leaves the syscall: the flags clear, and if the thread is tid 1
/// with pending signals and no handler running, delivery is prepared
/// so the return to user lands in the handler.
pub struct SyscallGuard {
    process: ProcessRef,
    tid: Tid,
}

impl SyscallGuard {
    /// Enter a system call. Returns `None` when the thread is already
    /// marked for exit, in which case the caller must not run the
    /// handler and should yield into the scheduler for teardown.
    pub fn enter(process: ProcessRef, tid: Tid, user_rsp: u64) -> Option<Self> {
        {
            let mut proc = process.lock();
            let thread = proc.thread_mut(tid)?;
            debug_assert!(!thread.uninterruptible);
            if thread.should_exit {
                return None;
            }
            thread.syscall_user_rsp = Some(user_rsp);
            thread.uninterruptible = true;
        }
        Some(Self { process, tid })
    }

    pub fn process(&self) -> &ProcessRef {
        &self.process
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    /// Run a cancellable region: signals may interrupt blocking inside
    /// `f`. The uninterruptible flag is dropped for the duration and
    /// re-taken after, exactly like the enable/redisable pair around
    /// the original sleeps.
    pub fn cancellable<R>(&self, f: impl FnOnce() -> R) -> R {
        {
            let mut proc = self.process.lock();
            if let Some(thread) = proc.thread_mut(self.tid) {
                debug_assert!(thread.uninterruptible);
                thread.uninterruptible = false;
            }
        }
        let r = f();
        {
            let mut proc = self.process.lock();
            if let Some(thread) = proc.thread_mut(self.tid) {
                thread.uninterruptible = true;
            }
        }
        r
    }
}

impl Drop for SyscallGuard {
    fn drop(&mut self) {
        let mut proc = self.process.lock();

        // Safe point: deliver a pending signal to thread 1 while the
        // recorded user stack pointer is still valid. A kill that
        // landed during the call is reaped by the scheduler at the
        // next dispatch.
        process::signal::deliver_pending(&mut proc, self.tid);

        if let Some(thread) = proc.thread_mut(self.tid) {
            thread.syscall_user_rsp = None;
            thread.uninterruptible = false;
        }
    }
}

/// Dispatch one system call for `(process, tid)`. `args` is the
/// argument struct, already copied from validated user memory.
///
/// `Some(v)` is the value for the saved context's `rax`; `None` means
/// the handler already installed a complete context (sigreturn) that
/// must not be touched.
pub fn dispatch(guard: &SyscallGuard, nr: Nr, args: &[u8]) -> Option<u64> {
    Some(match nr {
        Nr::Sleep => file::arg_u64(args).map_or(FAILURE, |ns| proc::sys_sleep(guard, ns)),
        Nr::Clock => proc::sys_clock(guard),
        Nr::Exit => {
            let status = file::arg_u64(args).unwrap_or(0);
            proc::sys_exit(guard, status as i32)
        }
        Nr::Open => file::sys_open(guard, args),
        Nr::Close => file::sys_close(guard, args),
        Nr::Read => file::sys_read(guard, args),
        Nr::Write => file::sys_write(guard, args),
        Nr::Truncate => file::sys_truncate(guard, args),
        Nr::Seek => file::sys_seek(guard, args),
        Nr::Access => file::sys_access(guard, args),
        Nr::Dup => file::sys_dup(guard, args),
        Nr::Pipe => file::sys_pipe(guard),
        Nr::ThreadCreate => proc::sys_thread_create(guard, args),
        Nr::Sbrk => file::arg_u64(args).map_or(FAILURE, |d| proc::sys_sbrk(guard, d as i64)),
        Nr::Exec => proc::sys_exec(guard, args),
        Nr::Chdir => file::sys_chdir(guard, args),
        Nr::Getcwd => file::sys_getcwd(guard, args),
        Nr::Getpid => proc::sys_getpid(guard),
        Nr::Getppid => proc::sys_getppid(guard),
        Nr::Sigsetup => sig::sys_sigsetup(guard, args),
        Nr::Sigreturn => return sig::sys_sigreturn(guard),
        Nr::Sigkill => sig::sys_sigkill(guard, args),
        Nr::Sigpause => sig::sys_sigpause(guard),
    })
}

/// Per-CPU kernel stack top of the current thread, for the entry stub.
/// The scheduler refreshes it at every dispatch.
#[cfg(target_os = "none")]
pub static CURRENT_KERNEL_STACK: core::sync::atomic::AtomicU64 =
    core::sync::atomic::AtomicU64::new(0);

/// Rust side of the fast-syscall entry. Runs on the thread's kernel
/// stack with interrupts re-enabled by the stub once the switch is
/// done.
///
/// The full user context the stub built becomes the thread's saved
/// context ("saved at the last entry to the kernel"), so a signal
/// delivered at the exit safe point displaces exactly the state the
/// sysret would have produced — return value included — and sigreturn
/// later resumes it bit for bit. The exit therefore always goes
/// through a context restore rather than a bare sysret.
///
/// # Safety
///
/// Called only from the syscall entry stub, with `ctx` pointing at the
/// context frame the stub pushed on this kernel stack.
#[cfg(target_os = "none")]
#[no_mangle]
pub unsafe extern "C" fn syscall_main(
    nr: u64,
    args_ptr: u64,
    args_sz: u64,
    ctx: *const crate::arch::Context,
) -> ! {
    let entry_context = unsafe { *ctx };
    let Some(process) = crate::sched::current_process() else {
        panic!("syscall from unknown process");
    };
    let tid = crate::sched::current_tid();

    {
        let mut proc = process.lock();
        if let Some(thread) = proc.thread_mut(tid) {
            thread.context = entry_context;
        }
    }

    let Some(guard) = SyscallGuard::enter(process.clone(), tid, entry_context.rsp) else {
        // Lazy exit: do not run the call, let the scheduler reap us.
        crate::sched::yield_now();
        unreachable!("exited thread resumed");
    };

    let result = match Nr::from_u64(nr) {
        None => Some(FAILURE),
        Some(nr) => {
            // Copy the argument struct out of validated user memory.
            let mut args = alloc::vec![0u8; (args_sz as usize).min(256)];
            let args_ok = args_sz == 0
                || guard
                    .process()
                    .lock()
                    .validate_range(args_ptr, args_sz)
                    .is_ok();
            if !args_ok {
                Some(FAILURE)
            } else {
                if args_sz != 0 {
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            args_ptr as *const u8,
                            args.as_mut_ptr(),
                            args.len(),
                        );
                    }
                }
                dispatch(&guard, nr, &args)
            }
        }
    };

    // Complete the would-be return state before the exit safe point so
    // signal delivery displaces a finished context.
    if let Some(rax) = result {
        let mut proc = process.lock();
        if let Some(thread) = proc.thread_mut(tid) {
            thread.context.rax = rax;
        }
    }
    drop(guard);

    let resume = {
        let proc = process.lock();
        proc.thread(tid)
            .map(|t| t.context)
            .unwrap_or(entry_context)
    };
    crate::arch::irq_save_disable();
    unsafe { crate::arch::x86_64::context::restore(&resume) }
}

/// The fast-syscall entry stub: switch to the thread kernel stack,
/// build a full saved context, and hand off to [`syscall_main`], which
/// never returns (the exit path restores the saved context).
///
/// `rcx`/`r11` carry the user rip/rflags (syscall hardware semantics)
/// and are clobbered as the ABI allows; `r10` is clobbered by the stub
/// itself.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
core::arch::global_asm!(
    ".global syscall_entry",
    "syscall_entry:",
    // Interrupts are masked (SFMASK); the user stack is still live.
    "mov r10, rsp",
    "mov rsp, [rip + {stack}]",
    // Interrupt-frame half of the context.
    "push 0x1b", // user ss
    "push r10",  // user rsp
    "push r11",  // user rflags
    "push 0x23", // user cs
    "push rcx",  // user rip
    // General-purpose half, context layout order.
    "push rbp",
    "push rax",
    "push 0", // rcx, clobbered by syscall
    "push rdx",
    "push rbx",
    "push rsi",
    "push rdi",
    "push r8",
    "push r9",
    "push 0", // r10, clobbered by the stub
    "push 0", // r11, clobbered by syscall
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "sti",
    // syscall_main(nr, args, args_sz, ctx)
    "mov rcx, rsp",
    "mov rdx, rsi",
    "mov rsi, rdi",
    "mov rdi, rax",
    "call syscall_main",
    "ud2",
    stack = sym CURRENT_KERNEL_STACK,
);

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mm::VirtAddr;
    use crate::process::table;
    use crate::process::thread::{Stack, Thread};
    use crate::process::{Process, ThreadState, FIRST_TID};

    pub(crate) fn test_process() -> (ProcessRef, Tid) {
        let pid = table::alloc_pid();
        let mut p = Process::bare(pid, 0);
        p.heap_begin = 0x10_0000;
        p.brk = 0x10_0000;
        p.unaligned_brk = 0x10_0000;
        p.threads.push(Thread::new(
            pid,
            FIRST_TID,
            Stack {
                base: VirtAddr::new(0x7000_0000),
                size: 0x10000,
            },
            0x40_0000,
        ));
        p.threads[0].state = ThreadState::Running;
        (table::insert(p), FIRST_TID)
    }

    #[test]
    fn unknown_numbers_are_rejected() {
        assert!(Nr::from_u64(0).is_none());
        assert!(Nr::from_u64(14).is_none());
        assert!(Nr::from_u64(15).is_none());
        assert!(Nr::from_u64(17).is_none());
        assert!(Nr::from_u64(27).is_none());
        assert_eq!(Nr::from_u64(26), Some(Nr::Sigpause));
    }

    #[test]
    fn guard_tracks_syscall_state() {
        let (process, tid) = test_process();

        {
            let guard = SyscallGuard::enter(process.clone(), tid, 0x7000_8000).unwrap();
            let p = process.lock();
            let t = p.thread(tid).unwrap();
            assert!(t.uninterruptible);
            assert_eq!(t.syscall_user_rsp, Some(0x7000_8000));
            drop(p);
            drop(guard);
        }

        let p = process.lock();
        let t = p.thread(tid).unwrap();
        assert!(!t.uninterruptible);
        assert_eq!(t.syscall_user_rsp, None);
        let pid = p.pid;
        drop(p);
        table::remove(pid);
    }

    #[test]
    fn guard_refuses_exiting_thread() {
        let (process, tid) = test_process();
        process.lock().thread_mut(tid).unwrap().should_exit = true;
        assert!(SyscallGuard::enter(process.clone(), tid, 0).is_none());
        let pid = process.lock().pid;
        table::remove(pid);
    }

    #[test]
    fn cancellable_window_toggles_uninterruptible() {
        let (process, tid) = test_process();
        let guard = SyscallGuard::enter(process.clone(), tid, 0).unwrap();

        guard.cancellable(|| {
            let p = process.lock();
            assert!(!p.thread(tid).unwrap().uninterruptible);
        });
        {
            let p = process.lock();
            assert!(p.thread(tid).unwrap().uninterruptible);
        }

        drop(guard);
        let pid = process.lock().pid;
        table::remove(pid);
    }

    #[test]
    fn guard_drop_delivers_pending_signal_to_tid1() {
        use crate::process::signal::{Disposition, MAX_SIGNALS};

        let (process, tid) = test_process();
        {
            let mut p = process.lock();
            let mut table = [Disposition::Ignore; MAX_SIGNALS];
            table[10] = Disposition::Handler(0x40_5000);
            p.signals.setup(0x40_6000, table);
            p.signals.arm(10);
        }

        let guard = SyscallGuard::enter(process.clone(), tid, 0x7000_8000).unwrap();
        drop(guard);

        let p = process.lock();
        assert_eq!(p.signals.current, Some(10));
        assert_eq!(p.thread(tid).unwrap().context.rip, 0x40_5000);
        let pid = p.pid;
        drop(p);
        table::remove(pid);
    }
}
