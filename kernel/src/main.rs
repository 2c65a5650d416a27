//! Bincows kernel entry
//!
//! The loader hands over one `BootInfo`; bring-up is strictly leaves
//! first: serial logging, physical memory, the kernel heap, the VFS,
//! the scheduler, the syscall MSRs, and finally the first user
//! process. The host build compiles this binary to an empty stub so
//! `cargo test` works on the workstation triple.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel_main {
    use bincows_kernel::boot::BootInfo;
    use bincows_kernel::{arch, fs, mm, sched, serial};

    extern "C" {
        // Provided by the syscall entry stub in the gateway module.
        fn syscall_entry();
    }

    /// Kernel entry, called by the loader stub with the handoff.
    #[no_mangle]
    pub extern "C" fn kernel_entry(boot_info: &'static BootInfo) -> ! {
        (boot_info.console_write)("bincows: booting\n");

        serial::init();
        log::info!("bincows kernel {}", env!("CARGO_PKG_VERSION"));

        unsafe {
            mm::pmm::PMM.lock().init_from_boot(boot_info);
        }
        bincows_kernel::ALLOCATOR.init();
        log::info!(
            "{} MiB free after heap bring-up",
            mm::pmm::PMM.lock().available_frames() * mm::FRAME_SIZE / (1024 * 1024)
        );

        arch::x86_64::interrupts::init();

        fs::init();
        fs::vfs::mount(fs::devfs::DEVFS.clone(), "/dev").expect("devfs mount");
        fs::vfs::mount(fs::memfs::MEMFS.clone(), "/mem").expect("memfs mount");

        sched::init();
        unsafe {
            arch::x86_64::init_syscall_msrs(syscall_entry as usize as u64);
        }

        sched::start();
        log::info!("scheduler started; entering idle");
        unsafe { sched::schedule() }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        log::error!("KERNEL PANIC: {info}");
        loop {
            bincows_kernel::arch::halt();
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    // The kernel only runs on bare metal; the host build exists for
    // the unit test suite in the library crate.
}
