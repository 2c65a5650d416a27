//! Threads
//!
//! A thread is a kernel stack, a user stack and a saved context. The
//! context is stored by value: it describes exactly what will be
//! restored the next time the scheduler dispatches the thread, whether
//! that is user code, a signal handler entry, or a kernel continuation
//! inside a blocked system call.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::arch::Context;
use crate::mm::VirtAddr;

/// Process identifier. Pid 0 is the kernel process.
pub type Pid = u32;

/// Thread identifier, unique within its process. Tid 1 is the first
/// thread and the only signal delivery target.
pub type Tid = u32;

pub const KERNEL_PID: Pid = 0;
pub const FIRST_TID: Tid = 1;

/// Per-thread kernel stack size.
pub const THREAD_KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Default user stack size.
pub const USER_STACK_SIZE: usize = 1024 * 1024;

/// Scheduling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// On a ready queue.
    Ready,
    /// Dispatched on some CPU.
    Running,
    /// Off all queues, waiting for an explicit wake.
    Blocked,
}

/// A user stack range.
#[derive(Debug, Clone, Copy)]
pub struct Stack {
    pub base: VirtAddr,
    pub size: usize,
}

impl Stack {
    pub const fn empty() -> Self {
        Self {
            base: VirtAddr::new(0),
            size: 0,
        }
    }

    pub fn top(&self) -> u64 {
        self.base.as_u64() + self.size as u64
    }
}

/// Kernel stack storage, allocated from the kernel heap.
pub struct KernelStack {
    mem: Box<[u8]>,
}

impl KernelStack {
    pub fn new() -> Self {
        Self {
            mem: vec![0u8; THREAD_KERNEL_STACK_SIZE].into_boxed_slice(),
        }
    }

    pub fn base(&self) -> u64 {
        self.mem.as_ptr() as u64
    }

    /// Stack top, where the syscall entry stub lands.
    pub fn top(&self) -> u64 {
        self.base() + self.mem.len() as u64
    }
}

impl Default for KernelStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Called when the thread is terminated, before its stacks are freed.
pub type ExitHook = fn(pid: Pid, tid: Tid, status: i32);

pub struct Thread {
    pub pid: Pid,
    pub tid: Tid,
    pub state: ThreadState,
    pub kernel_stack: KernelStack,
    pub stack: Stack,
    /// The context restored at the next dispatch.
    pub context: Context,
    /// During a system call, the user rsp at entry; signal delivery
    /// needs a valid user stack at any time. `None` outside syscalls.
    pub syscall_user_rsp: Option<u64>,
    /// Terminate at the next dispatch instead of running.
    pub should_exit: bool,
    pub exit_status: i32,
    /// Inside a non-cancellable kernel section; blocking wake-ups for
    /// signal arming must not interrupt it.
    pub uninterruptible: bool,
    /// Waiting in sigpause for any signal.
    pub sig_wait: bool,
    /// A futex wake was posted while the thread was not yet blocked.
    pub futex_signaled: bool,
    /// An unblock arrived before the thread finished blocking; consumed
    /// by the next block so the wake cannot be missed.
    pub wake_pending: bool,
    /// A signal was armed while the thread slept in a cancellable call.
    pub signal_interrupt: bool,
    /// LAPIC id of the CPU running this thread; only meaningful while
    /// `state == Running`.
    pub running_cpu: u32,
    exit_hooks: Vec<ExitHook>,
}

impl Thread {
    /// Create a thread entering user code at `entry` on `stack`. The
    /// thread starts blocked; the scheduler readies it at launch.
    pub fn new(pid: Pid, tid: Tid, stack: Stack, entry: u64) -> Self {
        Self {
            pid,
            tid,
            state: ThreadState::Blocked,
            kernel_stack: KernelStack::new(),
            stack,
            context: Context::user_entry(entry, stack.top()),
            syscall_user_rsp: None,
            should_exit: false,
            exit_status: 0,
            uninterruptible: false,
            sig_wait: false,
            futex_signaled: false,
            wake_pending: false,
            signal_interrupt: false,
            running_cpu: 0,
            exit_hooks: Vec::new(),
        }
    }

    pub fn add_exit_hook(&mut self, hook: ExitHook) {
        self.exit_hooks.push(hook);
    }

    /// Run and drain the exit hooks, in registration order.
    pub fn run_exit_hooks(&mut self, status: i32) {
        for hook in core::mem::take(&mut self.exit_hooks) {
            hook(self.pid, self.tid, status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_thread_is_blocked_with_user_context() {
        let stack = Stack {
            base: VirtAddr::new(0x7000_0000),
            size: USER_STACK_SIZE,
        };
        let t = Thread::new(7, FIRST_TID, stack, 0x40_1000);
        assert_eq!(t.state, ThreadState::Blocked);
        assert_eq!(t.context.rip, 0x40_1000);
        assert_eq!(t.context.rsp, 0x7000_0000 + USER_STACK_SIZE as u64);
        assert!(t.syscall_user_rsp.is_none());
        assert!(!t.should_exit);
    }

    #[test]
    fn exit_hooks_run_in_order_once() {
        use core::sync::atomic::{AtomicU32, Ordering};
        static SEQ: AtomicU32 = AtomicU32::new(0);

        fn first(_: Pid, _: Tid, _: i32) {
            SEQ.compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .unwrap();
        }
        fn second(_: Pid, _: Tid, _: i32) {
            SEQ.compare_exchange(1, 2, Ordering::SeqCst, Ordering::SeqCst)
                .unwrap();
        }

        let mut t = Thread::new(1, 1, Stack::empty(), 0);
        t.add_exit_hook(first);
        t.add_exit_hook(second);
        t.run_exit_hooks(0);
        assert_eq!(SEQ.load(Ordering::SeqCst), 2);

        // Drained: running again is a no-op.
        t.run_exit_hooks(0);
        assert_eq!(SEQ.load(Ordering::SeqCst), 2);
    }
}
