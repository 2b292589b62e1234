use std::io::Write;

use chrono::Local;
use env_logger::{Builder, Env, DEFAULT_FILTER_ENV};
use log::{LevelFilter, SetLoggerError};

/// Formats a log line as `<timestamp> [LEVEL] message`
fn format_line(timestamp: &str, level: log::Level, message: &std::fmt::Arguments) -> String {
    format!("{} [{}] {}", timestamp, level, message)
}

fn env_override() -> bool {
    std::env::var_os(DEFAULT_FILTER_ENV).is_some()
}

/// Initializes the global logger at `info`.
/// `RUST_LOG`, when set, takes precedence over any level set later.
pub fn init() -> Result<(), SetLoggerError> {
    let mut builder = Builder::new();
    builder
        .filter_level(LevelFilter::Trace)
        .parse_env(Env::default())
        .format(|buf, record| {
            let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string();
            writeln!(buf, "{}", format_line(&timestamp, record.level(), record.args()))
        });
    builder.try_init()?;

    if !env_override() {
        log::set_max_level(LevelFilter::Info);
    }
    Ok(())
}

/// Applies the configured level unless `RUST_LOG` is set
pub fn set_level(level: LevelFilter) {
    if !env_override() {
        log::set_max_level(level);
        log::debug!("Log level set to {}", level);
    }
}
