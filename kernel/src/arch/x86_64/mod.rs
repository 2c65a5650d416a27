//! x86-64 privileged operations
//!
//! CR3 switching, the fast-syscall MSRs and the segment selectors the
//! scheduler and signal code stamp into saved contexts.

pub mod context;
pub mod interrupts;

/// Kernel code selector (GDT entry 1, ring 0).
pub const KERNEL_CS: u16 = 0x08;
/// Kernel data selector.
pub const KERNEL_DS: u16 = 0x10;
/// User code selector (ring 3, RPL=3).
pub const USER_CS: u16 = 0x23;
/// User data selector (ring 3, RPL=3).
pub const USER_DS: u16 = 0x1b;

/// RFLAGS value for freshly built user contexts: IF set, reserved bit 1 set.
pub const USER_RFLAGS: u64 = 0x202;

/// Interrupt vector used by `sched_yield` (DPL=3, callable from user).
pub const YIELD_VECTOR: u8 = 47;

/// Read the physical address of the active PML4.
#[inline]
pub fn read_page_map() -> u64 {
    #[cfg(target_os = "none")]
    {
        let (frame, _) = ::x86_64::registers::control::Cr3::read();
        frame.start_address().as_u64()
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

/// Load CR3 with a new PML4 physical address.
///
/// # Safety
///
/// `pml4_paddr` must be the 4 KiB-aligned physical address of a valid
/// PML4 whose kernel top-half entries match the running kernel's.
#[inline]
pub unsafe fn write_page_map(pml4_paddr: u64) {
    #[cfg(target_os = "none")]
    {
        use ::x86_64::registers::control::{Cr3, Cr3Flags};
        use ::x86_64::structures::paging::PhysFrame;
        use ::x86_64::PhysAddr;
        let frame = PhysFrame::containing_address(PhysAddr::new(pml4_paddr));
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
    }
    #[cfg(not(target_os = "none"))]
    let _ = pml4_paddr;
}

/// Invalidate the TLB entry covering `vaddr`.
#[inline]
pub fn invlpg(vaddr: u64) {
    #[cfg(target_os = "none")]
    ::x86_64::instructions::tlb::flush(::x86_64::VirtAddr::new(vaddr));
    #[cfg(not(target_os = "none"))]
    let _ = vaddr;
}

/// Program the fast-syscall MSRs: LSTAR points at the kernel entry stub,
/// STAR selects the kernel/user segment bases, SFMASK clears IF on entry
/// so the stub can switch stacks before re-enabling interrupts.
///
/// # Safety
///
/// `entry` must be the address of a stub that follows the syscall ABI:
/// it may clobber rcx/r11 and must switch to the thread kernel stack
/// before touching memory below the user rsp.
pub unsafe fn init_syscall_msrs(entry: u64) {
    #[cfg(target_os = "none")]
    {
        use ::x86_64::registers::model_specific::{Efer, EferFlags, LStar, SFMask, Star};
        use ::x86_64::registers::rflags::RFlags;
        use ::x86_64::VirtAddr;

        unsafe {
            Efer::update(|f| f.insert(EferFlags::SYSTEM_CALL_EXTENSIONS));
            LStar::write(VirtAddr::new(entry));
            SFMask::write(RFlags::INTERRUPT_FLAG);
            // STAR: sysret CS/SS base at the user segments, syscall at
            // the kernel ones.
            Star::write_raw(0x13, KERNEL_CS);
        }
    }
    #[cfg(not(target_os = "none"))]
    let _ = entry;
}
