//! Serial logging backend
//!
//! All kernel output goes through the `log` facade; this module is the
//! bare-metal sink, a 16550 UART on COM1. The boot handoff's console
//! callback is only used for the few lines printed before `init` runs.
//! Host builds install no logger and the `log` macros compile to nothing.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod uart {
    use core::fmt::Write;

    use log::{Level, LevelFilter, Log, Metadata, Record};
    use spin::Mutex;
    use uart_16550::SerialPort;

    const COM1: u16 = 0x3f8;

    static PORT: Mutex<Option<SerialPort>> = Mutex::new(None);

    struct SerialLogger;

    impl Log for SerialLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= Level::Debug
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            crate::arch::without_interrupts(|| {
                if let Some(port) = PORT.lock().as_mut() {
                    let _ = writeln!(
                        port,
                        "[{:5} {}] {}",
                        record.level(),
                        record.target(),
                        record.args()
                    );
                }
            });
        }

        fn flush(&self) {}
    }

    static LOGGER: SerialLogger = SerialLogger;

    pub fn init() {
        let mut port = unsafe { SerialPort::new(COM1) };
        port.init();
        *PORT.lock() = Some(port);

        let _ = log::set_logger(&LOGGER);
        log::set_max_level(if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        });
    }
}

/// Bring up the COM1 logger. Safe to call exactly once, early in boot.
pub fn init() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    uart::init();
}
