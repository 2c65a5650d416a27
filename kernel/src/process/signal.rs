//! Signals
//!
//! Per-process disposition table of 32 signals, a pending bitmask, and
//! at most one handler running at a time. Delivery only ever targets
//! thread 1, and only at safe points: a trigger prepares the frame
//! immediately when no handler is active, otherwise the signal waits in
//! the pending mask for the next system-call exit.
//!
//! Preparing delivery is a context rewrite: thread 1's saved context is
//! stashed, the user stack gets the trampoline address pushed as a fake
//! return address, and the saved context is replaced by one entering
//! `handler(sig)` in ring 3. `sigreturn` undoes the swap.

use crate::arch::x86_64::{USER_CS, USER_DS, USER_RFLAGS};
use crate::arch::Context;
use crate::error::{KernelError, KernelResult};
use crate::process::thread::{ThreadState, Tid, FIRST_TID};
use crate::process::Process;

/// Number of signal slots.
pub const MAX_SIGNALS: usize = 32;

/// What to do with an armed signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Drop it.
    Ignore,
    /// Jump to the user handler at this address.
    Handler(u64),
}

/// Per-process signal state.
pub struct SignalState {
    /// Set once `sigsetup` ran; signals are ignored before that.
    installed: bool,
    dispositions: [Disposition; MAX_SIGNALS],
    /// User address of the trampoline that bridges handler return to
    /// `sigreturn`.
    trampoline: u64,
    /// Signal whose handler is currently running.
    pub current: Option<u8>,
    /// Armed signals awaiting delivery.
    pub pending: u32,
    /// Thread 1's context as it was before the running handler took
    /// over. Present exactly while `current` is.
    return_context: Option<Context>,
}

impl SignalState {
    pub const fn new() -> Self {
        Self {
            installed: false,
            dispositions: [Disposition::Ignore; MAX_SIGNALS],
            trampoline: 0,
            current: None,
            pending: 0,
            return_context: None,
        }
    }

    /// Install the trampoline and disposition table. The pointers were
    /// validated against the process image by the syscall layer.
    pub fn setup(&mut self, trampoline: u64, dispositions: [Disposition; MAX_SIGNALS]) {
        self.trampoline = trampoline;
        self.dispositions = dispositions;
        self.installed = true;
    }

    pub fn installed(&self) -> bool {
        self.installed
    }

    pub fn disposition(&self, sig: u8) -> Disposition {
        self.dispositions[sig as usize]
    }

    /// Arm `sig` in the pending mask.
    pub fn arm(&mut self, sig: u8) {
        self.pending |= 1 << sig;
    }

    /// Lowest armed signal, if any.
    pub fn next_pending(&self) -> Option<u8> {
        if self.pending == 0 {
            None
        } else {
            Some(self.pending.trailing_zeros() as u8)
        }
    }
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

/// Push the trampoline return address onto the user stack.
#[cfg(target_os = "none")]
fn push_return_address(user_rsp: u64, trampoline: u64) {
    // The process address space is mapped; the slot was range-checked
    // against the thread's stack.
    unsafe { (user_rsp as *mut u64).write(trampoline) };
}

#[cfg(not(target_os = "none"))]
fn push_return_address(_user_rsp: u64, _trampoline: u64) {}

/// Rewrite thread 1 so its next dispatch runs `handler(sig)` in user
/// mode, saving the displaced context for `sigreturn`.
///
/// Returns whether thread 1 was blocked and needs an unblock (which the
/// caller must issue after releasing the process lock).
///
/// The caller holds the process lock.
pub fn prepare(process: &mut Process, sig: u8) -> KernelResult<bool> {
    let handler = match process.signals.disposition(sig) {
        Disposition::Handler(h) => h,
        Disposition::Ignore => return Err(KernelError::WrongState),
    };
    debug_assert!(process.signals.current.is_none());
    debug_assert!(process.signals.return_context.is_none());

    let trampoline = process.signals.trampoline;
    let thread = process
        .thread_mut(FIRST_TID)
        .ok_or(KernelError::NotFound)?;

    // The handler runs on the user stack: below the syscall entry rsp
    // when thread 1 is inside a system call, below the interrupted rsp
    // otherwise.
    let user_rsp = thread.syscall_user_rsp.unwrap_or(thread.context.rsp);
    let frame_rsp = user_rsp.checked_sub(8).ok_or(KernelError::BadAddress {
        addr: user_rsp,
    })?;
    if frame_rsp < thread.stack.base.as_u64() {
        log::warn!("stack overflow delivering signal {sig} to pid {}", process.pid);
        return Err(KernelError::BadAddress { addr: frame_rsp });
    }

    push_return_address(frame_rsp, trampoline);

    // Swap the context: the displaced one comes back via sigreturn.
    let displaced = thread.context;

    thread.context.rip = handler;
    thread.context.rdi = sig as u64;
    thread.context.rsp = frame_rsp;
    thread.context.cs = USER_CS as u64;
    thread.context.ss = USER_DS as u64;
    thread.context.rflags = USER_RFLAGS;

    process.signals.return_context = Some(displaced);
    process.signals.current = Some(sig);
    process.signals.pending &= !(1 << sig);

    let thread = process.thread_mut(FIRST_TID).unwrap();
    let was_blocked = thread.state == ThreadState::Blocked;
    if was_blocked {
        thread.signal_interrupt = true;
    }
    Ok(was_blocked)
}

/// `sigreturn`: restore the context displaced by [`prepare`]. Fails
/// outside a handler. Returns the restored context so the syscall layer
/// can resume straight into it.
///
/// The caller holds the process lock.
pub fn end_of_signal(process: &mut Process) -> KernelResult<Context> {
    if process.signals.current.is_none() {
        return Err(KernelError::WrongState);
    }
    let restored = process
        .signals
        .return_context
        .take()
        .expect("current signal without a saved context");
    process.signals.current = None;

    let thread = process
        .thread_mut(FIRST_TID)
        .ok_or(KernelError::NotFound)?;
    thread.context = restored;
    Ok(restored)
}

/// Arm `sig` on process `pid`: deliver immediately when possible, pend
/// otherwise, and wake every thread sitting in sigpause.
pub fn trigger(pid: crate::process::Pid, sig: u8) -> KernelResult<()> {
    if sig as usize >= MAX_SIGNALS {
        return Err(KernelError::InvalidArgument);
    }

    let process_ref = crate::process::table::get(pid).ok_or(KernelError::NotFound)?;

    let mut unblock_first: bool = false;
    let mut sig_waiters: alloc::vec::Vec<Tid> = alloc::vec::Vec::new();
    {
        let mut process = process_ref.lock();

        if process.signals.installed() {
            match process.signals.disposition(sig) {
                Disposition::Ignore => {}
                Disposition::Handler(_) => {
                    if process.signals.current.is_none() {
                        match prepare(&mut process, sig) {
                            Ok(wake) => unblock_first = wake,
                            // Undeliverable right now (stack overflow):
                            // leave it armed.
                            Err(_) => process.signals.arm(sig),
                        }
                    } else {
                        process.signals.arm(sig);
                    }
                }
            }
        }

        for thread in process.threads.iter_mut() {
            if thread.sig_wait {
                thread.sig_wait = false;
                thread.signal_interrupt = true;
                sig_waiters.push(thread.tid);
            }
        }
    }

    // Wake-ups only after the process lock is gone.
    if unblock_first {
        crate::sched::unblock(pid, FIRST_TID);
    }
    for tid in sig_waiters {
        crate::sched::unblock(pid, tid);
    }
    Ok(())
}

/// Deliver the next pending signal at a syscall exit of thread 1, when
/// no handler is already running. The caller holds the process lock.
pub fn deliver_pending(process: &mut Process, current_tid: Tid) -> bool {
    if current_tid != FIRST_TID || process.signals.current.is_some() {
        return false;
    }
    let Some(sig) = process.signals.next_pending() else {
        return false;
    };
    match process.signals.disposition(sig) {
        Disposition::Ignore => {
            // Disposition changed since arming; drop it.
            process.signals.pending &= !(1 << sig);
            false
        }
        Disposition::Handler(_) => prepare(process, sig).is_ok(),
    }
}
