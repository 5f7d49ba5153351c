//! Logging/tracing setup (C14): a console layer always on, plus an optional
//! rolling file layer when `logging.file` is configured. Mirrors the
//! `tracing_subscriber::registry()...init()` idiom this service has always
//! used, extended with a file sink.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LoggingConfig, RollingInterval};

/// Must be kept alive for the lifetime of the process — dropping it stops
/// the non-blocking file writer from flushing.
pub struct LoggingGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initializes the global `tracing` subscriber from `config`. `level` (from
/// the CLI) overrides `config.level` when set.
pub fn init(config: &LoggingConfig, level_override: Option<&str>) -> LoggingGuard {
    let level = level_override.unwrap_or(&config.level);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("castrelay={level}")));

    let console_layer = config
        .console
        .then(|| tracing_subscriber::fmt::layer().with_target(false));

    let (file_layer, file_guard) = match &config.file {
        Some(path) => {
            let directory = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("castrelay.log");
            let rotation = match config.rolling_interval {
                RollingInterval::Daily => tracing_appender::rolling::Rotation::DAILY,
                RollingInterval::Hourly => tracing_appender::rolling::Rotation::HOURLY,
                RollingInterval::Never => tracing_appender::rolling::Rotation::NEVER,
            };
            let rolling = tracing_appender::rolling::Builder::new()
                .rotation(rotation)
                .filename_prefix(file_name)
                .max_log_files(config.retained_files.max(1))
                .build(directory)
                .expect("log directory is writable");
            let (non_blocking, guard) = tracing_appender::non_blocking(rolling);
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(non_blocking);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    LoggingGuard { _file_guard: file_guard }
}
