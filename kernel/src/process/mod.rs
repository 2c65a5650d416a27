//! Processes
//!
//! A process is an address space, a thread list, an FD table, a working
//! directory, a heap break and a signal state — all guarded by the
//! per-process lock its table entry wraps it in. Threads share the
//! page map; the first thread is special only in that signals target
//! it.

use alloc::string::String;
use alloc::vec::Vec;

use crate::elf::{self, Program};
use crate::error::{KernelError, KernelResult};
use crate::mm::vmap::{self, PhysAddr, VirtAddr};
use crate::mm::FRAME_SIZE;

pub mod fd;
pub mod signal;
pub mod table;
pub mod thread;

pub use fd::{FdMask, FileDescriptor, MAX_FDS};
pub use signal::SignalState;
pub use table::ProcessRef;
pub use thread::{Pid, Stack, Thread, ThreadState, Tid, FIRST_TID, KERNEL_PID};

/// Base of the first thread's user stack.
const USER_STACK_TOP: u64 = 0x0000_7fff_ff00_0000;

/// Gap between successive thread stacks.
const STACK_GAP: u64 = 2 * 1024 * 1024;

pub struct Process {
    pub pid: Pid,
    pub ppid: Pid,
    /// Physical address of the process PML4.
    pub page_map: PhysAddr,
    pub threads: Vec<Thread>,
    /// The loaded program; `None` only for the kernel process.
    pub program: Option<Program>,
    /// Monotonic timestamp of creation, for CLOCK.
    pub clock_begin: u64,
    /// Bottom of the process heap (just above the highest ELF segment).
    pub heap_begin: u64,
    /// Page-aligned break; everything in `[heap_begin, brk)` is mapped.
    pub brk: u64,
    /// The break as user code sees it; `unaligned_brk <= brk`.
    pub unaligned_brk: u64,
    pub cwd: String,
    pub fds: [FileDescriptor; MAX_FDS],
    pub signals: SignalState,
}

impl Process {
    /// A process shell with no threads, program or address space; the
    /// building block of `create_process` and the kernel process.
    pub fn bare(pid: Pid, ppid: Pid) -> Self {
        Self {
            pid,
            ppid,
            page_map: PhysAddr::new(0),
            threads: Vec::new(),
            program: None,
            clock_begin: crate::sched::now_ns(),
            heap_begin: 0,
            brk: 0,
            unaligned_brk: 0,
            cwd: String::from("/"),
            fds: [const { FileDescriptor::None }; MAX_FDS],
            signals: SignalState::new(),
        }
    }

    pub fn thread(&self, tid: Tid) -> Option<&Thread> {
        self.threads.iter().find(|t| t.tid == tid)
    }

    pub fn thread_mut(&mut self, tid: Tid) -> Option<&mut Thread> {
        self.threads.iter_mut().find(|t| t.tid == tid)
    }

    /// Lowest free FD slot.
    pub fn free_fd(&self) -> KernelResult<usize> {
        self.fds
            .iter()
            .position(FileDescriptor::is_none)
            .ok_or(KernelError::TooManyOpenFiles)
    }

    /// Whether the process is still running any thread.
    pub fn alive(&self) -> bool {
        !self.threads.is_empty()
    }

    /// Validate that `[addr, addr+len)` is process-accessible memory:
    /// a thread stack, the heap window, or an ELF segment.
    pub fn validate_range(&self, addr: u64, len: u64) -> KernelResult<()> {
        let end = addr.checked_add(len).ok_or(KernelError::BadAddress { addr })?;

        for t in &self.threads {
            let base = t.stack.base.as_u64();
            if addr >= base && end <= base + t.stack.size as u64 {
                return Ok(());
            }
        }

        if addr >= self.heap_begin && end <= self.brk {
            return Ok(());
        }

        if let Some(program) = &self.program {
            if program.contains(addr, len) {
                return Ok(());
            }
        }

        Err(KernelError::BadAddress { addr })
    }

    /// Move the user-visible break by `delta` bytes, mapping or
    /// unmapping whole pages as the aligned break moves. Returns the
    /// previous aligned break; on failure nothing changes.
    pub fn sbrk(&mut self, delta: i64) -> KernelResult<u64> {
        let old_brk = self.brk;
        let unaligned_new = self
            .unaligned_brk
            .checked_add_signed(delta)
            .ok_or(KernelError::InvalidArgument)?;
        let new_brk = crate::mm::frame_ceil(unaligned_new);

        debug_assert_eq!(old_brk % FRAME_SIZE as u64, 0);

        if !vmap::is_user(new_brk) || unaligned_new < self.heap_begin {
            return Err(KernelError::InvalidArgument);
        }

        if new_brk > old_brk {
            let pages = ((new_brk - old_brk) / FRAME_SIZE as u64) as usize;
            #[cfg(target_os = "none")]
            {
                if crate::mm::pmm::PMM.lock().available_frames() <= pages {
                    return Err(KernelError::OutOfMemory);
                }
                unsafe {
                    crate::mm::paging::alloc_pages(
                        VirtAddr::new(old_brk),
                        pages,
                        crate::mm::paging::PageFlags::user_data(),
                    );
                }
            }
            #[cfg(not(target_os = "none"))]
            let _ = pages;
        } else if new_brk < old_brk {
            #[cfg(target_os = "none")]
            unsafe {
                crate::mm::paging::unmap_pages(
                    VirtAddr::new(new_brk),
                    ((old_brk - new_brk) / FRAME_SIZE as u64) as usize,
                    true,
                );
            }
        }

        self.unaligned_brk = unaligned_new;
        self.brk = new_brk;
        Ok(old_brk)
    }
}

/// Pack a string list into the double-NUL-terminated blob the entry
/// convention uses on the user stack.
pub fn marshal_strings(strings: &[&str]) -> Vec<u8> {
    let mut blob = Vec::new();
    for s in strings {
        blob.extend_from_slice(s.as_bytes());
        blob.push(0);
    }
    blob.push(0);
    blob
}

/// Number of strings in a marshalled blob.
pub fn count_strings(blob: &[u8]) -> usize {
    let mut count = 0;
    let mut i = 0;
    while i < blob.len() && blob[i] != 0 {
        count += 1;
        while i < blob.len() && blob[i] != 0 {
            i += 1;
        }
        i += 1;
    }
    count
}

/// Copy a blob to the user stack.
#[cfg(target_os = "none")]
fn copy_to_user_stack(dst: u64, blob: &[u8]) {
    unsafe { core::ptr::copy_nonoverlapping(blob.as_ptr(), dst as *mut u8, blob.len()) };
}

#[cfg(not(target_os = "none"))]
fn copy_to_user_stack(_dst: u64, _blob: &[u8]) {}

/// Marshal argv/envp onto thread 1's user stack and seed its entry
/// registers: `rdi=argc, rsi=argv, rdx=envc, rcx=envp`.
pub fn set_entry_arguments(
    process: &mut Process,
    argv: &[u8],
    envp: &[u8],
) -> KernelResult<()> {
    let entry = process
        .program
        .as_ref()
        .map(|p| p.entry)
        .ok_or(KernelError::WrongState)?;
    let argc = count_strings(argv) as u64;
    let envc = count_strings(envp) as u64;

    let thread = process
        .thread_mut(FIRST_TID)
        .ok_or(KernelError::NotFound)?;
    let mut rsp = thread.stack.top();

    // Stack copies are 16-byte aligned.
    let argv_sz = (argv.len() + 15) & !15;
    let envp_sz = (envp.len() + 15) & !15;

    rsp -= argv_sz as u64;
    let user_argv = rsp;
    rsp -= envp_sz as u64;
    let user_envp = rsp;

    // Terminating frame pointer.
    rsp -= 8;
    let frame_begin = rsp;

    if rsp <= thread.stack.base.as_u64() {
        return Err(KernelError::OutOfMemory);
    }

    copy_to_user_stack(user_argv, argv);
    copy_to_user_stack(user_envp, envp);
    copy_to_user_stack(frame_begin, &0u64.to_ne_bytes());

    thread.context.rdi = argc;
    thread.context.rsi = user_argv;
    thread.context.rdx = envc;
    thread.context.rcx = user_envp;
    thread.context.rsp = rsp;
    thread.context.rbp = frame_begin;
    thread.context.rip = entry;
    Ok(())
}

/// Stack placement for thread number `tid`.
fn stack_for_tid(tid: Tid) -> Stack {
    let size = thread::USER_STACK_SIZE;
    let top = USER_STACK_TOP - (tid as u64 - 1) * (size as u64 + STACK_GAP);
    Stack {
        base: VirtAddr::new(top - size as u64),
        size,
    }
}

/// Map a fresh user stack for thread `tid` in the current address
/// space.
fn alloc_user_stack(tid: Tid) -> Stack {
    let stack = stack_for_tid(tid);
    #[cfg(target_os = "none")]
    unsafe {
        crate::mm::paging::alloc_pages(
            stack.base,
            stack.size / FRAME_SIZE,
            crate::mm::paging::PageFlags::user_data(),
        );
    }
    stack
}

/// Create a process from an ELF image: fresh page map, loaded segments,
/// one thread, FDs inherited from the parent filtered by `fd_mask`,
/// inherited working directory, break just above the image.
///
/// The created process is inserted in the table but not yet scheduled;
/// the caller marshals entry arguments and launches it.
pub fn create_process(
    elf_image: &[u8],
    parent: &ProcessRef,
    fd_mask: FdMask,
) -> KernelResult<Pid> {
    let program = elf::parse(elf_image)?;

    let pid = table::alloc_pid();
    let mut process = Process::bare(pid, 0);

    // Fresh address space with the kernel top half shared.
    #[cfg(target_os = "none")]
    {
        let saved = crate::mm::paging::user_page_map();
        unsafe {
            let map = crate::mm::paging::alloc_user_page_map();
            crate::mm::paging::set_user_page_map(map);
            process.page_map = map;
            if let Err(e) = elf::load(elf_image, &program) {
                crate::mm::paging::set_user_page_map(saved);
                return Err(e);
            }
        }
    }

    let stack = alloc_user_stack(FIRST_TID);
    process
        .threads
        .push(Thread::new(pid, FIRST_TID, stack, program.entry));

    // Inherit from the parent under its lock.
    {
        let parent = parent.lock();
        process.ppid = parent.pid;
        process.cwd = parent.cwd.clone();
        for (i, slot) in parent.fds.iter().enumerate() {
            if fd_mask & (1 << i) != 0 {
                process.fds[i] = slot.duplicate()?;
            }
        }
    }

    let heap_begin = crate::mm::frame_ceil(program.highest_end());
    process.heap_begin = heap_begin;
    process.brk = heap_begin;
    process.unaligned_brk = heap_begin;
    process.program = Some(program);

    table::insert(process);
    log::debug!("process {pid} created");
    Ok(pid)
}

/// Exec-in-place: tear the user half down, reload a new image, reset to
/// a single fresh thread. The process keeps pid, FDs and cwd.
pub fn replace_process(process: &mut Process, elf_image: &[u8]) -> KernelResult<()> {
    let program = elf::parse(elf_image)?;

    #[cfg(target_os = "none")]
    unsafe {
        crate::mm::paging::free_user_half(process.page_map);
        let map = crate::mm::paging::alloc_user_page_map();
        crate::mm::paging::set_user_page_map(map);
        process.page_map = map;
        elf::load(elf_image, &program)?;
    }

    process.threads.clear();
    let stack = alloc_user_stack(FIRST_TID);
    process
        .threads
        .push(Thread::new(process.pid, FIRST_TID, stack, program.entry));

    let heap_begin = crate::mm::frame_ceil(program.highest_end());
    process.heap_begin = heap_begin;
    process.brk = heap_begin;
    process.unaligned_brk = heap_begin;
    process.program = Some(program);
    process.signals = SignalState::new();
    Ok(())
}

/// Create a new thread running `entry(argument)`. Returns the tid.
pub fn create_thread(process: &mut Process, entry: u64, argument: u64) -> KernelResult<Tid> {
    let tid = process
        .threads
        .iter()
        .map(|t| t.tid)
        .max()
        .unwrap_or(0)
        + 1;

    let stack = alloc_user_stack(tid);
    let mut thread = Thread::new(process.pid, tid, stack, entry);
    thread.context.rdi = argument;
    process.threads.push(thread);
    Ok(tid)
}

/// Tear down an exited process: close FDs, drop SHM instances, run the
/// final vfile flush, free the user address space, drop the table
/// entry.
pub fn free_process(pid: Pid) {
    let Some(entry) = table::remove(pid) else {
        return;
    };
    {
        // Descriptors are moved out first; closing them can spin on
        // vfile access and must happen outside the process lock.
        let mut taken: Vec<FileDescriptor> = Vec::new();
        {
            let mut process = entry.lock();
            debug_assert!(!process.alive());
            for slot in process.fds.iter_mut() {
                if !slot.is_none() {
                    taken.push(core::mem::replace(slot, FileDescriptor::None));
                }
            }
        }
        drop(taken);
    }

    crate::fs::memfs::MEMFS.release_process(pid);
    crate::fs::vfile::flush_pending();

    #[cfg(target_os = "none")]
    {
        let process = entry.lock();
        if process.page_map.as_u64() != 0 {
            unsafe {
                crate::mm::paging::free_user_half(process.page_map);
                crate::mm::pmm::PMM.lock().free(process.page_map);
            }
        }
    }

    log::debug!("process {pid} freed");
}
