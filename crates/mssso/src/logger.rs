use colored::Colorize;
use log::{Level, LevelFilter};
use std::io::Write;

/// Installs the process-wide logger.
///
/// Browser protocol chatter from `headless_chrome` and its websocket transport
/// is capped at `warn` unless trace output is requested.
pub fn init_logger(level: LevelFilter) {
    let noisy = if level >= LevelFilter::Trace {
        LevelFilter::Trace
    } else {
        LevelFilter::Warn
    };

    env_logger::Builder::new()
        .filter(None, level)
        .filter_module("headless_chrome", noisy)
        .filter_module("tungstenite", noisy)
        .format(|buf, record| {
            let level = match record.level() {
                Level::Error => "ERROR".red(),
                Level::Warn => "WARN".yellow(),
                Level::Info => "INFO".green(),
                Level::Debug => "DEBUG".blue(),
                Level::Trace => "TRACE".purple(),
            };
            writeln!(buf, "[{}] - {}", level, record.args())
        })
        .init();
}

/// Redacts a secret for log output, keeping only its length.
pub fn redact(value: &str) -> String {
    format!("<{} chars>", value.chars().count())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_hides_content() {
        let out = redact("s3cr3t-cookie");
        assert_eq!(out, "<13 chars>");
        assert!(!out.contains("s3cr3t"));
    }
}
