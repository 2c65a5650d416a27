//! Architecture support
//!
//! Only x86-64 is supported. Everything that touches privileged CPU state
//! is funnelled through this module so the rest of the kernel stays
//! host-buildable: on the host triple the interrupt and CR3 primitives
//! degrade to no-ops and the unit tests never reach them.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use x86_64::context::Context;

/// Saved interrupt-enable state, returned by [`irq_save_disable`].
#[derive(Debug, Clone, Copy)]
pub struct IrqState {
    was_enabled: bool,
}

/// Disable interrupts, returning the previous state for [`irq_restore`].
#[inline]
pub fn irq_save_disable() -> IrqState {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let was_enabled = ::x86_64::instructions::interrupts::are_enabled();
        ::x86_64::instructions::interrupts::disable();
        IrqState { was_enabled }
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        IrqState { was_enabled: true }
    }
}

/// Restore the interrupt-enable state saved by [`irq_save_disable`].
#[inline]
pub fn irq_restore(state: IrqState) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    if state.was_enabled {
        ::x86_64::instructions::interrupts::enable();
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = state;
}

/// True when interrupts are currently enabled on this CPU.
#[inline]
pub fn interrupts_enabled() -> bool {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        ::x86_64::instructions::interrupts::are_enabled()
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        true
    }
}

/// Run `f` with interrupts disabled, restoring the previous state after.
#[inline]
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let state = irq_save_disable();
    let r = f();
    irq_restore(state);
    r
}

/// Identifier of the CPU we are running on (its LAPIC id).
///
/// The temp-window carve-up and the `RUNNING` bookkeeping key on this.
#[inline]
pub fn cpu_id() -> u32 {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        // LAPIC id lives in CPUID leaf 1, EBX[31:24].
        let r = unsafe { core::arch::x86_64::__cpuid(1) };
        r.ebx >> 24
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        0
    }
}

/// Halt until the next interrupt.
#[inline]
pub fn halt() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    ::x86_64::instructions::hlt();
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    core::hint::spin_loop();
}

/// Atomically enable interrupts and halt; the idle loop's wait state.
#[inline]
pub fn enable_interrupts_and_halt() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    ::x86_64::instructions::interrupts::enable_and_hlt();
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    core::hint::spin_loop();
}
