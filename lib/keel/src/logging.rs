//! Logging setup shared by every binary and library in the workspace.
//!
//! Long-lived components own a child `Logger` created with
//! `log.new(o!(...))`; library code that is handed no logger uses
//! `null()`.

pub use slog::{crit, debug, error, info, o, trace, warn};
pub use slog::{Discard, Drain, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Builds the process-wide terminal logger writing to stderr.
pub fn init() -> Logger {
    TerminalLoggerBuilder::new()
        .level(Severity::Debug)
        .destination(Destination::Stderr)
        .build()
        .expect("Logger construction failed")
}

/// A logger that discards everything. Used by unit tests and by library
/// consumers that do not care about output.
pub fn null() -> Logger {
    Logger::root(Discard, o!())
}
