//! Kernel logger: the `log` facade over the serial port.

use conquer_once::spin::OnceCell;
use log::{LevelFilter, Metadata, Record};

static LOGGER: OnceCell<SerialLogger> = OnceCell::uninit();

struct SerialLogger {
    level: LevelFilter,
}

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        #[cfg(target_arch = "x86_64")]
        crate::serial_println!(
            "[{:>5}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
        #[cfg(not(target_arch = "x86_64"))]
        let _ = record;
    }

    fn flush(&self) {}
}

/// Install the serial logger. Called once at boot phase 0.
pub fn init(level: LevelFilter) {
    let _ = LOGGER.try_init_once(|| SerialLogger { level });
    if let Ok(logger) = LOGGER.try_get() {
        if log::set_logger(logger).is_ok() {
            log::set_max_level(level);
            log::info!("logger: serial logging at {}", level);
        }
    }
}
