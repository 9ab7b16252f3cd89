//! Kernel backend for the `log` crate.
//!
//! Records are rendered through the kernel `println!` path, which writes to
//! the VGA text console and mirrors to serial on bare metal (standard
//! output on hosted builds). Warnings carry a level tag so diagnostics-only
//! conditions (double frees, bad heap headers) stand out on the console.

use log::{Level, LevelFilter, Metadata, Record};

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        match record.level() {
            Level::Error => println!("[ERROR] {}", record.args()),
            Level::Warn => println!("[WARN] {}", record.args()),
            Level::Info => println!("{}", record.args()),
            _ => println!("[{}] {}", record.target(), record.args()),
        }
    }

    fn flush(&self) {}
}

/// Install the kernel logger. Called once, early in boot, before any
/// subsystem that emits diagnostics.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}
