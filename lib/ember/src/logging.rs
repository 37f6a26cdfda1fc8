//! Logging bootstrap. Subsystems receive a `Logger` by reference and log
//! through the re-exported macros; only the runner decides where output goes.

use sloggers::file::FileLoggerBuilder;
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;
use std::path::Path;

pub use slog::{crit, debug, error, info, o, trace, warn, Logger};

/// Builds the process logger. With a file path, output rotates at
/// `rotate_size` bytes keeping two generations; without one, it goes to
/// stderr.
pub fn init(level: &str, file: Option<&Path>, rotate_size: u64) -> Result<Logger, sloggers::Error> {
    let severity = parse_level(level);

    match file {
        Some(path) => FileLoggerBuilder::new(path)
            .level(severity)
            .rotate_size(rotate_size)
            .rotate_keep(2)
            .build(),
        None => TerminalLoggerBuilder::new()
            .level(severity)
            .destination(Destination::Stderr)
            .build(),
    }
}

fn parse_level(level: &str) -> Severity {
    match level {
        "trace" => Severity::Trace,
        "debug" => Severity::Debug,
        "warning" => Severity::Warning,
        "error" => Severity::Error,
        "critical" => Severity::Critical,
        _ => Severity::Info,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_logger_builds() {
        let log = init("debug", None, 0).unwrap();
        info!(log, "logger bootstrap"; "check" => true);
    }

    #[test]
    fn test_unknown_level_defaults_to_info() {
        assert!(matches!(parse_level("bogus"), Severity::Info));
    }
}
