//! Per-CPU temp mapping window
//!
//! Each CPU owns a private 512 GiB slice of the high half
//! (`vmap::temp_window_base(cpu)`) used for short-lived mappings: building
//! an SHM directory, zeroing a foreign frame, walking another process's
//! memory. Because the window is never visible to any other CPU, release
//! needs no TLB shootdown; the price is that the whole critical section
//! must run with interrupts disabled so the owner cannot migrate or be
//! preempted while holding it.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch;
use crate::mm::vmap::{self, VirtAddr};

const MAX_CPUS: usize = 64;

static LOCKED: [AtomicBool; MAX_CPUS] = [const { AtomicBool::new(false) }; MAX_CPUS];

/// Acquire this CPU's temp window and return its base address.
///
/// Interrupts must already be disabled and must stay disabled until
/// [`release`]; the window is not re-entrant.
pub fn lock() -> VirtAddr {
    debug_assert!(
        !arch::interrupts_enabled(),
        "temp window taken with interrupts enabled"
    );
    let cpu = arch::cpu_id() as usize;
    assert!(cpu < MAX_CPUS);
    let was = LOCKED[cpu].swap(true, Ordering::Acquire);
    assert!(!was, "temp window already locked on cpu {cpu}");
    vmap::temp_window_base(cpu as u32)
}

/// Release this CPU's temp window.
///
/// All mappings created inside the window must have been torn down or
/// detached by the caller; nothing is flushed here because no other CPU
/// ever observed them.
pub fn release() {
    debug_assert!(
        !arch::interrupts_enabled(),
        "temp window released with interrupts enabled"
    );
    let cpu = arch::cpu_id() as usize;
    let was = LOCKED[cpu].swap(false, Ordering::Release);
    assert!(was, "temp window released but not locked on cpu {cpu}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_release_cycle() {
        let base = lock();
        assert_eq!(base, vmap::temp_window_base(0));
        release();
        // Re-acquirable after release.
        let again = lock();
        assert_eq!(again, base);
        release();
    }
}
