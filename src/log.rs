//! Messages go to stderr, prefixed with the program name and level

use log::{Level, LevelFilter, Metadata, Record};

static DAEMON_LOGGER: DaemonLogger = DaemonLogger;

struct DaemonLogger;

impl log::Log for DaemonLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!(
                "lircd: {}: {}",
                match record.level() {
                    Level::Trace => "trace",
                    Level::Debug => "debug",
                    Level::Info => "info",
                    Level::Warn => "warn",
                    Level::Error => "error",
                },
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// The level for the given number of `-v` flags, or `-q`
pub fn level(verbose: u8, quiet: bool) -> LevelFilter {
    if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

/// Install the logger. Only the first call has any effect on where
/// messages go; every call sets the level.
pub fn init(verbose: u8, quiet: bool) {
    let _ = log::set_logger(&DAEMON_LOGGER);

    log::set_max_level(level(verbose, quiet));
}
