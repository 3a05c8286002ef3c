use crate::platform;
use crate::report::StackWriter;
use core::fmt::Write;
use core::sync::atomic::{AtomicUsize, Ordering};
use log::{Level, LevelFilter, Log, Metadata, Record};

/// `log` backend that never allocates: each record is formatted into a stack
/// buffer and written to fd 2 with a single `write`.
pub struct StderrLogger {
    level: AtomicUsize,
}

static LOGGER: StderrLogger = StderrLogger::new();

impl StderrLogger {
    pub const fn new() -> Self {
        Self {
            level: AtomicUsize::new(0),
        }
    }

    fn max_level(&self) -> LevelFilter {
        match self.level.load(Ordering::Relaxed) {
            1 => LevelFilter::Error,
            2 => LevelFilter::Warn,
            3 => LevelFilter::Info,
            4 => LevelFilter::Debug,
            5 => LevelFilter::Trace,
            _ => LevelFilter::Off,
        }
    }
}

impl Default for StderrLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut w = StackWriter::<512>::new();
        let _ = writeln!(
            w,
            "hardmalloc {} [{}]: {}",
            record.level(),
            record.target(),
            record.args()
        );
        platform::write_stderr(w.as_bytes());
    }

    fn flush(&self) {}
}

/// Numeric verbosity used by the `log_level` option: 0 is off, 1 error
/// through 5 trace.
pub fn level_from_verbosity(verbosity: usize) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Install [`StderrLogger`] as the process logger.
///
/// Returns false when another logger was already installed; the existing
/// logger is left in place and keeps receiving our records.
pub fn init(level: LevelFilter) -> bool {
    let verbosity = match level.to_level() {
        None => 0,
        Some(Level::Error) => 1,
        Some(Level::Warn) => 2,
        Some(Level::Info) => 3,
        Some(Level::Debug) => 4,
        Some(Level::Trace) => 5,
    };
    LOGGER.level.store(verbosity, Ordering::Relaxed);
    if log::set_logger(&LOGGER).is_err() {
        return false;
    }
    log::set_max_level(level);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_filters() {
        assert_eq!(level_from_verbosity(0), LevelFilter::Off);
        assert_eq!(level_from_verbosity(2), LevelFilter::Warn);
        assert_eq!(level_from_verbosity(4), LevelFilter::Debug);
        assert_eq!(level_from_verbosity(99), LevelFilter::Trace);
    }

    #[test]
    fn disabled_logger_filters_everything() {
        let logger = StderrLogger::new();
        let meta = Metadata::builder().level(Level::Error).build();
        assert!(!logger.enabled(&meta));
        logger.level.store(2, Ordering::Relaxed);
        assert!(logger.enabled(&meta));
        let debug = Metadata::builder().level(Level::Debug).build();
        assert!(!logger.enabled(&debug));
    }
}
