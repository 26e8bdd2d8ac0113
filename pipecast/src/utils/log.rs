use once_cell::sync::{Lazy, OnceCell};
use slog::{o, Drain, Level, LevelFilter, Logger};
use std::sync::Mutex;

use crate::config::{LogConfig, LogFormat};

static CONFIGURED_LOGGER: OnceCell<Logger> = OnceCell::new();

static FALLBACK_LOGGER: Lazy<Logger> = Lazy::new(|| build_logger(&LogConfig::default()));

/// Installs the process logger. Only the first call takes effect.
pub fn init(cfg: &LogConfig) {
    let _ = CONFIGURED_LOGGER.set(build_logger(cfg));
}

pub fn logger() -> &'static Logger {
    CONFIGURED_LOGGER.get().unwrap_or(&FALLBACK_LOGGER)
}

/// Case-insensitive level name, as accepted in `log.level`.
pub fn parse_level(name: &str) -> Option<Level> {
    match name.to_ascii_lowercase().as_str() {
        "critical" | "crit" => Some(Level::Critical),
        "error" => Some(Level::Error),
        "warning" | "warn" => Some(Level::Warning),
        "info" => Some(Level::Info),
        "debug" => Some(Level::Debug),
        "trace" => Some(Level::Trace),
        _ => None,
    }
}

// config validation rejects unknown names before this runs
fn build_logger(cfg: &LogConfig) -> Logger {
    let level = parse_level(&cfg.level).unwrap_or(Level::Info);
    let drain: Box<dyn Drain<Ok = (), Err = slog::Never> + Send> = match cfg.format {
        LogFormat::Json => Box::new(slog_json::Json::default(std::io::stderr()).fuse()),
        LogFormat::Term => {
            let decorator = slog_term::TermDecorator::new().stderr().build();
            Box::new(slog_term::FullFormat::new(decorator).build().fuse())
        }
    };
    let drain = Mutex::new(drain).fuse();
    let drain = LevelFilter::new(drain, level).fuse();
    Logger::root(drain, o!("app" => "pipecast"))
}

// 定义自己的宏
#[macro_export]
macro_rules! info {
    ($($arg:tt)+) => {
        slog::info!($crate::utils::log::logger(), $($arg)+)
    }
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)+) => {
        slog::debug!($crate::utils::log::logger(), $($arg)+)
    }
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)+) => {
        slog::error!($crate::utils::log::logger(), $($arg)+)
    }
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)+) => {
        slog::warn!($crate::utils::log::logger(), $($arg)+)
    }
}
