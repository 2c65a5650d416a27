//! Interrupt table and core vectors
//!
//! Only the vectors the scheduler and the memory system need: the LAPIC
//! timer tick, the user-callable yield vector and the page fault
//! handler.
//!
//! The timer and yield vectors may context-switch, so they enter
//! through asm stubs that push the interrupted thread's full register
//! file in saved-context layout before any Rust runs. The page fault
//! handler never switches directly and uses the plain interrupt ABI.

#![cfg(target_os = "none")]

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::arch::Context;
use crate::mm::paging::{classify_fault, FaultOutcome};
use crate::process::signal;
use crate::sched;

/// LAPIC timer vector.
pub const TIMER_VECTOR: u8 = 32;

/// SIGSEGV signal number posted on user page faults.
const SIGSEGV: u8 = 11;

/// LAPIC register window (fixed MMIO mapping).
const LAPIC_BASE: u64 = 0xffff_ffff_1fff_f000;
const LAPIC_EOI: u64 = LAPIC_BASE + 0xb0;

fn lapic_eoi() {
    unsafe { (LAPIC_EOI as *mut u32).write_volatile(0) };
}

extern "C" {
    fn timer_vector_stub();
    fn yield_vector_stub();
}

// Both stubs build a full `Context` on the interrupted stack: the
// hardware frame is already in place, the pushes below it complete the
// layout, and rdi receives the context pointer. If the Rust handler
// returns, the registers are restored untouched.
macro_rules! vector_stub {
    ($stub:ident, $handler:ident) => {
        core::arch::global_asm!(
            concat!(".global ", stringify!($stub)),
            concat!(stringify!($stub), ":"),
            "push rbp",
            "push rax",
            "push rcx",
            "push rdx",
            "push rbx",
            "push rsi",
            "push rdi",
            "push r8",
            "push r9",
            "push r10",
            "push r11",
            "push r12",
            "push r13",
            "push r14",
            "push r15",
            "mov rdi, rsp",
            concat!("call ", stringify!($handler)),
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop r11",
            "pop r10",
            "pop r9",
            "pop r8",
            "pop rdi",
            "pop rsi",
            "pop rbx",
            "pop rdx",
            "pop rcx",
            "pop rax",
            "pop rbp",
            "iretq",
        );
    };
}

vector_stub!(timer_vector_stub, timer_vector_handler);
vector_stub!(yield_vector_stub, yield_vector_handler);

/// Timer tick. Preempts the interrupted thread unless the CPU was
/// idle, in which case the idle loop picks the woken work up itself.
#[no_mangle]
extern "C" fn timer_vector_handler(ctx: &Context) {
    let preempt = sched::timer_tick();
    lapic_eoi();

    if preempt && sched::current_pid() != crate::process::KERNEL_PID {
        sched::save_preempted(ctx);
        unsafe { sched::schedule() }
    }
}

/// Voluntary (or kill-forced) reschedule, callable from ring 3.
#[no_mangle]
extern "C" fn yield_vector_handler(ctx: &Context) {
    if sched::current_pid() == crate::process::KERNEL_PID {
        // The idle loop yields nowhere; just resume it.
        return;
    }
    sched::save_preempted(ctx);
    unsafe { sched::schedule() }
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.page_fault.set_handler_fn(page_fault_handler);
        unsafe {
            idt[TIMER_VECTOR]
                .set_handler_addr(x86_64::VirtAddr::new(timer_vector_stub as usize as u64));
            idt[super::YIELD_VECTOR]
                .set_handler_addr(x86_64::VirtAddr::new(yield_vector_stub as usize as u64))
                .set_privilege_level(x86_64::PrivilegeLevel::Ring3);
        }
        idt
    };
}

/// Load the IDT on this CPU.
pub fn init() {
    IDT.load();
}

extern "x86-interrupt" fn page_fault_handler(
    frame: InterruptStackFrame,
    error: PageFaultErrorCode,
) {
    let fault_addr = x86_64::registers::control::Cr2::read_raw();
    let user_mode = error.contains(PageFaultErrorCode::USER_MODE);

    match classify_fault(fault_addr, user_mode) {
        FaultOutcome::UserSegv => {
            let pid = sched::current_pid();
            log::warn!(
                "pid {pid}: page fault at {fault_addr:#x} (rip {:#x})",
                frame.instruction_pointer.as_u64()
            );
            // SIGSEGV when a handler is installed, death otherwise.
            let handled = crate::process::table::get(pid)
                .map(|p| p.lock().signals.installed())
                .unwrap_or(false);
            if handled {
                let _ = signal::trigger(pid, SIGSEGV);
            } else {
                let _ = sched::kill_process(pid, -(SIGSEGV as i32));
            }
            sched::yield_now();
        }
        FaultOutcome::KernelFatal => {
            panic!(
                "kernel page fault at {fault_addr:#x}, rip {:#x}, error {error:?}",
                frame.instruction_pointer.as_u64()
            );
        }
    }
}
