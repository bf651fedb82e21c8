// src/utils/log.rs

//! Console run report for the CLI.
//!
//! Diagnostics go through the `log` facade. These helpers print the
//! operator-facing report of a run, filtered by the same level the CLI
//! configured for `env_logger` (`--verbose` or `RUST_LOG`).

use std::sync::OnceLock;

use chrono::Local;
use log::{Level, LevelFilter};

static CONSOLE_LEVEL: OnceLock<LevelFilter> = OnceLock::new();

/// Set the report threshold. Only the first call has an effect; before it
/// the threshold is `Info`.
pub fn init(level: LevelFilter) {
    let _ = CONSOLE_LEVEL.set(level);
}

fn passes(level: Level, threshold: LevelFilter) -> bool {
    level <= threshold
}

fn line(level: Level, message: &str) -> String {
    format!("[{}] [{level:<5}] {message}", Local::now().format("%Y-%m-%d %H:%M:%S"))
}

fn emit(level: Level, message: &str) {
    let threshold = CONSOLE_LEVEL.get().copied().unwrap_or(LevelFilter::Info);
    if !passes(level, threshold) {
        return;
    }
    match level {
        Level::Error | Level::Warn => eprintln!("{}", line(level, message)),
        _ => println!("{}", line(level, message)),
    }
}

pub fn info(message: &str) {
    emit(Level::Info, message);
}

pub fn warn(message: &str) {
    emit(Level::Warn, message);
}

pub fn error(message: &str) {
    emit(Level::Error, message);
}

/// `[n/total] message`
pub fn step(n: usize, total: usize, message: &str) {
    emit(Level::Info, &format!("[{n}/{total}] {message}"));
}

/// Banner opening a run.
pub fn header(title: &str) {
    let rule = "=".repeat(title.len() + 8);
    emit(Level::Info, &rule);
    emit(Level::Info, &format!("    {title}"));
    emit(Level::Info, &rule);
}

/// Indented detail under the current step.
pub fn sub_item(message: &str) {
    emit(Level::Info, &format!("    - {message}"));
}

/// Key/value block closing a run.
pub fn summary(title: &str, items: &[(&str, String)]) {
    emit(Level::Info, &format!("{title}:"));
    let width = items.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    for (key, value) in items {
        emit(Level::Info, &format!("    {key:<width$}  {value}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_follows_filter() {
        assert!(passes(Level::Info, LevelFilter::Info));
        assert!(passes(Level::Error, LevelFilter::Warn));
        assert!(!passes(Level::Info, LevelFilter::Warn));
        assert!(!passes(Level::Debug, LevelFilter::Info));
        assert!(passes(Level::Debug, LevelFilter::Debug));
        assert!(!passes(Level::Error, LevelFilter::Off));
    }

    #[test]
    fn test_line_includes_level() {
        let text = line(Level::Error, "scraper failed");
        assert!(text.contains("[ERROR] scraper failed"), "{text}");
        assert!(line(Level::Info, "ok").contains("[INFO ] ok"));
    }
}
