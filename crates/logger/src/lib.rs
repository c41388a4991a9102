//! Logger
//!
//! A `log` backend printing to the serial port, usable from the host kernel as well as from VM
//! exit handlers.
#![cfg_attr(not(test), no_std)]

pub mod serial;

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicBool, Ordering};

use log::{LevelFilter, Metadata, Record};
use spin::Mutex;

static LOGGER: LockedLogger = LockedLogger(Mutex::new(Logger {}));
static IS_INITIALIZED: AtomicBool = AtomicBool::new(false);

struct LockedLogger(Mutex<Logger>);

struct Logger {}

/// The lock is never waited for: a VM exit handler may log while the interrupted guest holds
/// it, records are dropped instead.
impl log::Log for LockedLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        match self.0.try_lock() {
            Some(logger) => logger.enabled(metadata),
            None => false,
        }
    }

    fn log(&self, record: &Record) {
        if let Some(logger) = self.0.try_lock() {
            logger.log(record)
        }
    }

    fn flush(&self) {}
}

impl Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            serial::_print(format_args!("{}", Line(record)));
        }
    }
}

/// One log line: `[LEVEL | target] message`.
struct Line<'a, 'r>(&'a Record<'r>);

impl fmt::Display for Line<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let record = self.0;
        write!(f, "[{} | {}] {}", record.level(), record.target(), record.args())?;
        f.write_char('\n')
    }
}

pub fn init(level: LevelFilter) {
    match IS_INITIALIZED.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst) {
        Ok(_) => {
            serial::init();
            if log::set_logger(&LOGGER).is_err() {
                serial::_print(format_args!("Another logger is already installed\n"));
            }
            log::set_max_level(level);
        }
        Err(_) => {
            log::warn!("Logger is already initialized, skipping init");
        }
    };
}

// ————————————————————————————————— Tests —————————————————————————————————— //

#[cfg(test)]
mod test {
    use super::*;
    use log::{Level, Log};

    #[test]
    fn line_format() {
        let line = Line(
            &Record::builder()
                .args(format_args!("VCPU {} launching", 1))
                .level(Level::Info)
                .target("vcpu::vcpu")
                .build(),
        )
        .to_string();
        assert_eq!(line, "[INFO | vcpu::vcpu] VCPU 1 launching\n");
    }

    #[test]
    fn busy_logger_drops_records() {
        let _guard = LOGGER.0.lock();
        log::set_max_level(LevelFilter::Trace);

        let metadata = Metadata::builder().level(Level::Error).target("vcpu").build();
        assert!(!LOGGER.enabled(&metadata));

        // Returns without waiting for the lock, and without printing
        LOGGER.log(
            &Record::builder()
                .args(format_args!("exit while the guest logs"))
                .level(Level::Error)
                .target("vcpu")
                .build(),
        );
    }
}
