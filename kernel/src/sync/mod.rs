//! Synchronization primitives
//!
//! The kernel's locks are spinlocks that disable interrupts for the time
//! they are held; sleeping under one is a bug. When several are needed the
//! acquisition order is fixed: PMM, VMM, heap, process, vfile, vfs-cache.

mod ring;
mod spinlock;

pub use ring::RingBuffer;
pub use spinlock::{IrqSpinlock, IrqSpinlockGuard};
