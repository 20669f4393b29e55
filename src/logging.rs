//! Kernel logging facility
//!
//! Wires the `log` crate facade to the serial port. Log levels follow the
//! build configuration: debug builds log down to `Debug`, release builds
//! stop at `Info`.

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Global logger instance.
pub static LOGGER: Logger = Logger::new();

pub struct Logger {
    inner: Mutex<()>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    pub const fn new() -> Logger {
        Logger {
            inner: Mutex::new(()),
        }
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    /// Formats records as "[LEVEL] message".
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _guard = self.inner.lock();
            crate::serial_println!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the kernel logger. Call once, before the allocators come up,
/// so their reporting has somewhere to go.
pub fn init() {
    log::set_logger(&LOGGER)
        .map(|()| {
            log::set_max_level(
                #[cfg(debug_assertions)]
                LevelFilter::Debug,
                #[cfg(not(debug_assertions))]
                LevelFilter::Info,
            )
        })
        .expect("Logger initialization failed");
}
