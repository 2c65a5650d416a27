//! Scheduler
//!
//! Pre-emptive, priority-queue driven, SMP-prepared: per-CPU current
//! slots and IPI-shaped kill paths, though a single run queue serves
//! all CPUs for now. Each user thread is bound to a kernel thread; a
//! blocked thread is simply off every queue until someone unblocks it.
//!
//! The block/unblock handshake is race-free by token: an unblock that
//! beats the corresponding block leaves `wake_pending` set, and block
//! consumes it instead of sleeping. Ordering is guaranteed by the
//! per-process lock both sides take.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::process::{self, table, Pid, ThreadState, Tid, KERNEL_PID};
use crate::sync::IrqSpinlock;

pub mod queue;
pub mod sleep;

pub use queue::{ReadyQueue, PRIORITY_LEVELS};
pub use sleep::SleepList;

/// Timer period: the LAPIC timer fires at 1 kHz.
pub const NS_PER_TICK: u64 = 1_000_000;

/// Interrupt vector for voluntary yield, callable from ring 3.
pub const YIELD_VECTOR: u8 = crate::arch::x86_64::YIELD_VECTOR;

const MAX_CPUS: usize = 64;

/// Why a blocked thread woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// An explicit `unblock` (data ready, deadline passed).
    Unblocked,
    /// A signal was armed for the thread's process.
    Signal,
}

static READY: IrqSpinlock<ReadyQueue> = IrqSpinlock::new(ReadyQueue::new());
static SLEEPERS: IrqSpinlock<SleepList> = IrqSpinlock::new(SleepList::new());
static MONOTONIC_NS: AtomicU64 = AtomicU64::new(0);
static STARTED: AtomicBool = AtomicBool::new(false);

/// Per-CPU current thread, packed `(pid << 32) | tid`; 0 is the idle
/// kernel thread.
static CURRENT: [AtomicU64; MAX_CPUS] = [const { AtomicU64::new(0) }; MAX_CPUS];

fn pack(pid: Pid, tid: Tid) -> u64 {
    ((pid as u64) << 32) | tid as u64
}

fn set_current(pid: Pid, tid: Tid) {
    CURRENT[crate::arch::cpu_id() as usize].store(pack(pid, tid), Ordering::Release);
}

fn current_packed() -> u64 {
    CURRENT[crate::arch::cpu_id() as usize].load(Ordering::Acquire)
}

/// Pid of the thread running on this CPU (the kernel pid while idle).
pub fn current_pid() -> Pid {
    (current_packed() >> 32) as Pid
}

/// Tid of the thread running on this CPU.
pub fn current_tid() -> Tid {
    current_packed() as Tid
}

/// The current process's table entry.
pub fn current_process() -> Option<process::ProcessRef> {
    table::get(current_pid())
}

/// Monotonic nanoseconds since boot.
pub fn now_ns() -> u64 {
    MONOTONIC_NS.load(Ordering::Relaxed)
}

/// Initialise scheduler state and create the kernel process (pid 0).
pub fn init() {
    let kernel = process::Process::bare(KERNEL_PID, KERNEL_PID);
    table::insert(kernel);
}

/// Mark the scheduler started: from here on, timer ticks may preempt.
pub fn start() {
    STARTED.store(true, Ordering::Release);
}

pub fn is_running() -> bool {
    STARTED.load(Ordering::Acquire)
}

/// One LAPIC timer tick: advance the clock, wake due sleepers, report
/// whether the caller should preempt into `schedule`.
pub fn timer_tick() -> bool {
    let now = MONOTONIC_NS.fetch_add(NS_PER_TICK, Ordering::Relaxed) + NS_PER_TICK;

    let due = SLEEPERS.lock().pop_due(now);
    for (pid, tid) in due {
        unblock(pid, tid);
    }

    is_running()
}

/// Drop every ready-queue entry of `pid` (process teardown).
pub fn purge_ready(pid: Pid) {
    READY.lock().purge(pid, None);
}

/// Mark a thread ready and queue it at top priority.
pub fn launch(pid: Pid, tid: Tid) {
    if let Some(entry) = table::get(pid) {
        let mut proc = entry.lock();
        if let Some(thread) = proc.thread_mut(tid) {
            thread.state = ThreadState::Ready;
        }
    }
    READY.lock().enqueue_top(pid, tid);
}

/// Give up the CPU voluntarily. From user or kernel threads this
/// raises the yield vector; the handler saves the context and enters
/// `schedule`.
pub fn yield_now() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("int 47");
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    core::hint::spin_loop();
}

/// Block the current thread until [`unblock`] or signal arming.
///
/// The wake token makes the pair race-free: an unblock issued before we
/// got here is consumed instead of lost. Cancellable callers see
/// [`WakeReason::Signal`] when a signal armed while they slept.
pub fn block() -> WakeReason {
    let pid = current_pid();
    let tid = current_tid();
    let Some(entry) = table::get(pid) else {
        return WakeReason::Unblocked;
    };

    {
        let mut proc = entry.lock();
        let Some(thread) = proc.thread_mut(tid) else {
            return WakeReason::Unblocked;
        };
        if thread.wake_pending {
            thread.wake_pending = false;
            return WakeReason::Unblocked;
        }
        if thread.signal_interrupt && !thread.uninterruptible {
            thread.signal_interrupt = false;
            return WakeReason::Signal;
        }
        thread.state = ThreadState::Blocked;
    }

    // Off the queues; the next dispatch happens after someone readies
    // us again. On the host there is no dispatcher, so fall through.
    #[cfg(target_os = "none")]
    yield_now();

    let mut proc = entry.lock();
    match proc.thread_mut(tid) {
        Some(thread) => {
            if thread.state == ThreadState::Blocked {
                // Host build: nothing actually switched us out.
                thread.state = ThreadState::Running;
            }
            if thread.signal_interrupt && !thread.uninterruptible {
                thread.signal_interrupt = false;
                WakeReason::Signal
            } else {
                WakeReason::Unblocked
            }
        }
        None => WakeReason::Unblocked,
    }
}

/// Make a blocked thread runnable; posts the wake token when the
/// thread has not finished blocking yet.
pub fn unblock(pid: Pid, tid: Tid) {
    let Some(entry) = table::get(pid) else {
        return;
    };
    let mut ready = false;
    {
        let mut proc = entry.lock();
        let Some(thread) = proc.thread_mut(tid) else {
            return;
        };
        match thread.state {
            ThreadState::Blocked => {
                thread.state = ThreadState::Ready;
                ready = true;
            }
            _ => thread.wake_pending = true,
        }
    }
    if ready {
        READY.lock().enqueue_top(pid, tid);
    }
}

/// Sleep for at least `ns` nanoseconds. Cancellable: returns
/// [`WakeReason::Signal`] early when a signal arms.
pub fn sleep(ns: u64) -> WakeReason {
    let pid = current_pid();
    let tid = current_tid();
    let deadline = now_ns().saturating_add(ns);

    #[cfg(not(target_os = "none"))]
    {
        // Host: time is virtual; just advance it.
        MONOTONIC_NS.fetch_add(ns, Ordering::Relaxed);
        let _ = (pid, tid, deadline);
        return WakeReason::Unblocked;
    }

    #[cfg(target_os = "none")]
    {
        SLEEPERS.lock().insert(deadline, pid, tid);
        loop {
            match block() {
                WakeReason::Signal => {
                    SLEEPERS.lock().remove(pid, tid);
                    return WakeReason::Signal;
                }
                WakeReason::Unblocked => {
                    if now_ns() >= deadline {
                        return WakeReason::Unblocked;
                    }
                    // Spurious wake; the sleep entry is still queued.
                }
            }
        }
    }
}

/// Wait until any signal arms for the current process (SIGPAUSE).
pub fn pause_for_signal() {
    let pid = current_pid();
    let tid = current_tid();
    let Some(entry) = table::get(pid) else {
        return;
    };
    {
        let mut proc = entry.lock();
        if let Some(thread) = proc.thread_mut(tid) {
            thread.sig_wait = true;
        }
    }
    loop {
        match block() {
            WakeReason::Signal => break,
            WakeReason::Unblocked => {
                // Only signal arming releases a pause.
                let mut proc = entry.lock();
                match proc.thread_mut(tid) {
                    Some(thread) if thread.sig_wait => continue,
                    _ => break,
                }
            }
        }
    }
}

/// Mark every thread of `pid` for exit with `status`; the scheduler
/// performs the teardown at next dispatch. Threads running on another
/// CPU are kicked with a reschedule IPI.
pub fn kill_process(pid: Pid, status: i32) -> crate::error::KernelResult<()> {
    let entry = table::get(pid).ok_or(crate::error::KernelError::NotFound)?;
    let mut wake = alloc::vec::Vec::new();
    {
        let mut proc = entry.lock();
        for thread in proc.threads.iter_mut() {
            thread.should_exit = true;
            thread.exit_status = status;
            if thread.state == ThreadState::Blocked {
                wake.push(thread.tid);
            }
            #[cfg(target_os = "none")]
            if thread.state == ThreadState::Running && thread.running_cpu != crate::arch::cpu_id()
            {
                // SMP: a reschedule IPI would go to thread.running_cpu
                // here; single-CPU bring-up has nobody to kick.
            }
        }
    }
    for tid in wake {
        unblock(pid, tid);
    }
    Ok(())
}

/// Terminate one thread: exit hooks, stacks, table entry. The process
/// lock is held by the caller; returns whether the process emptied.
fn terminate_thread(proc: &mut process::Process, tid: Tid, status: i32) -> bool {
    if let Some(index) = proc.threads.iter().position(|t| t.tid == tid) {
        proc.threads[index].run_exit_hooks(status);
        // Kernel stack storage is owned; dropping the thread frees it.
        proc.threads.remove(index);
    }
    !proc.alive()
}

/// The dispatch loop: process exits, pick the next ready thread,
/// switch address space and resume its context; halt when idle. The
/// idle CPU also drains the lazy metadata flush queue.
///
/// # Safety
///
/// Interrupts must be disabled; the current context must already be
/// saved in its thread.
#[cfg(target_os = "none")]
pub unsafe fn schedule() -> ! {
    loop {
        let next = READY.lock().pop_next();
        let Some((pid, tid)) = next else {
            // Idle: pid 0 owns the CPU. Background work, then halt
            // until an interrupt readies someone.
            set_current(KERNEL_PID, 0);
            crate::fs::vfile::flush_pending();
            crate::arch::enable_interrupts_and_halt();
            crate::arch::irq_save_disable();
            continue;
        };

        let Some(entry) = table::get(pid) else {
            continue;
        };
        let mut proc = entry.lock();
        let Some(thread) = proc.thread_mut(tid) else {
            continue;
        };

        if thread.should_exit {
            let status = thread.exit_status;
            if terminate_thread(&mut proc, tid, status) {
                drop(proc);
                process::free_process(pid);
            }
            continue;
        }

        thread.state = ThreadState::Running;
        thread.running_cpu = crate::arch::cpu_id();
        let context = thread.context;
        let kernel_stack_top = thread.kernel_stack.top();
        let page_map = proc.page_map;
        drop(proc);

        set_current(pid, tid);
        crate::syscall::CURRENT_KERNEL_STACK.store(kernel_stack_top, Ordering::Release);
        if page_map.as_u64() != 0 {
            unsafe { crate::mm::paging::set_user_page_map(page_map) };
        }
        unsafe { crate::arch::x86_64::context::restore(&context) }
    }
}

/// Save `context` into the interrupted thread (called by interrupt
/// entry paths before `schedule`). Preempted threads go back on the
/// queue one level down so CPU hogs drift toward lower priority.
pub fn save_preempted(context: &crate::arch::Context) {
    let pid = current_pid();
    let tid = current_tid();
    if pid == KERNEL_PID {
        return;
    }
    let Some(entry) = table::get(pid) else {
        return;
    };
    let mut proc = entry.lock();
    let Some(thread) = proc.thread_mut(tid) else {
        return;
    };
    thread.context = *context;
    if thread.state == ThreadState::Running {
        thread.state = ThreadState::Ready;
        drop(proc);
        READY.lock().enqueue(pid, tid, 1);
    }
}
