//! Bincows kernel library
//!
//! A monolithic x86-64 kernel: physical and virtual memory management, a
//! pre-emptive process/thread scheduler with signals, a POSIX-flavoured
//! system-call gateway and a virtual file system tree.
//!
//! The crate builds for `x86_64-unknown-none` as the real kernel, and for
//! the host triple so that the unit test suite can exercise the allocators,
//! queues, caches and tables with `std` available.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]
#![cfg_attr(target_os = "none", feature(abi_x86_interrupt))]

extern crate alloc;

// Host target: link std so unit tests can allocate normally.
#[cfg(not(target_os = "none"))]
extern crate std;

// On bare metal the kernel heap (mm::heap) is the global allocator. On the
// host, delegate to the system allocator so test code using Vec/String
// works without booting the memory subsystem.
#[cfg(target_os = "none")]
#[global_allocator]
pub static ALLOCATOR: mm::heap::GlobalHeap = mm::heap::GlobalHeap::empty();

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

pub mod arch;
pub mod boot;
pub mod elf;
pub mod error;
pub mod fs;
pub mod ipc;
pub mod mm;
pub mod process;
pub mod sched;
pub mod serial;
pub mod sync;
pub mod syscall;

pub use error::KernelError;

/// Heap allocation failure in a no_std kernel is unrecoverable.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap allocation error: {:?}", layout);
}
