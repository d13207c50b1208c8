use std::path::PathBuf;

use clap::ValueEnum;
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const LOG_FILE_NAME: &str = "eam.log";

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Lenient parse for config values; unknown strings fall back to `info`.
    pub fn from_config(value: &str) -> Self {
        <LogLevel as ValueEnum>::from_str(value.trim(), true).unwrap_or_default()
    }
}

#[derive(Clone, Debug)]
pub struct LogConfig {
    pub level: LogLevel,
    pub dir: PathBuf,
    /// Also write human-readable output to stderr.
    pub dev: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to create log directory {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to install subscriber: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}

/// Keeps the non-blocking writer flushing; hold it for the process lifetime.
pub struct LogGuard {
    _file: WorkerGuard,
}

/// JSON lines go to a daily-rolling `eam.log` under `config.dir`. In dev mode
/// a compact stderr layer is added.
pub fn init(config: &LogConfig) -> Result<LogGuard, InitError> {
    std::fs::create_dir_all(&config.dir).map_err(|source| InitError::Io {
        path: config.dir.clone(),
        source,
    })?;
    let appender = rolling::daily(&config.dir, LOG_FILE_NAME);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = fmt::layer()
        .json()
        .with_current_span(false)
        .with_writer(file_writer)
        .boxed();
    let console_layer = config.dev.then(|| {
        fmt::layer()
            .with_target(config.level >= LogLevel::Debug)
            .with_writer(std::io::stderr)
            .boxed()
    });

    tracing_subscriber::registry()
        .with(env_filter(config.level))
        .with(file_layer)
        .with(console_layer)
        .try_init()?;

    Ok(LogGuard { _file: guard })
}

fn env_filter(level: LogLevel) -> EnvFilter {
    for var in ["EAM_LOG_FILTER", "RUST_LOG"] {
        if let Ok(filter) = std::env::var(var) {
            if let Ok(filter) = EnvFilter::try_new(filter) {
                return filter;
            }
        }
    }
    default_filter(level)
}

fn default_filter(level: LogLevel) -> EnvFilter {
    let directive = match level {
        LogLevel::Trace => "info,eam=trace,eam_core=trace,eam_server=trace,eam_client=trace",
        LogLevel::Debug => "info,eam=debug,eam_core=debug,eam_server=debug,eam_client=debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    };
    EnvFilter::new(directive)
}
