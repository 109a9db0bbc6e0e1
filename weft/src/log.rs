//! Logging utils. See ["log" crate documentation](https://docs.rs/log/) for
//! details.
//!
//! Example:
//! ```no_run
//! use log::{info, LevelFilter};
//!
//! weft::log::init(LevelFilter::Info);
//! info!("runtime is up");
//! ```

use std::io::Write;

use log::{LevelFilter, Log, Metadata, Record};

/// [Log](https://docs.rs/log/latest/log/trait.Log.html) trait implementation
/// writing level-prefixed lines to the sandbox's stderr.
///
/// Logging never goes through the evented I/O path: stderr under WASI is
/// blocking and the logger must stay usable from inside the event loop and
/// the scheduler themselves.
pub struct RuntimeLogger;

impl Log for RuntimeLogger {
    #[inline(always)]
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let stderr = std::io::stderr();
        let mut out = stderr.lock();
        let _ = writeln!(
            out,
            "{:>5} {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    #[inline(always)]
    fn flush(&self) {}
}

static LOGGER: RuntimeLogger = RuntimeLogger;

/// Install the runtime logger as the `log` facade's sink. Idempotent: if a
/// logger is already installed the call leaves it in place.
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
