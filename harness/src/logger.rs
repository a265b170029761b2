// Minimal stderr logger for the harness.

use log::{LevelFilter, Metadata, Record};

static LOGGER: Logger = Logger;

struct Logger;

pub fn init(filter: LevelFilter) {
    // Cannot fail: nothing else installs a logger before us
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(filter);
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!(
                "[{:<5} {}] {}",
                record.level(),
                record.module_path().unwrap_or_default(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}
