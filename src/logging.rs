//! Logging configuration and initialization.
//!
//! Sets up the tracing subscriber based on the application configuration,
//! supporting stdout, stderr, and file output with configurable formats.

use std::fs::OpenOptions;
use std::io;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::config::LoggingConfig;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable pretty format.
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON format for structured logging.
    Json,
}

impl LogFormat {
    /// Parses a format name, defaulting to pretty on unknown input.
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

/// Initializes the logging system based on configuration.
///
/// Returns a guard that must be kept alive for the duration of the program
/// to ensure all logs are flushed.
pub fn init_logging(config: &LoggingConfig) -> io::Result<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        // Default level plus reduced noise from dependencies.
        EnvFilter::new(format!(
            "{},hyper=warn,rustls=warn,notify=warn",
            config.level.to_lowercase()
        ))
    });

    let (writer, guard) = match config.output.to_lowercase().as_str() {
        "stdout" => tracing_appender::non_blocking(Box::new(io::stdout()) as Box<dyn io::Write + Send>),
        "stderr" => tracing_appender::non_blocking(Box::new(io::stderr()) as Box<dyn io::Write + Send>),
        path => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_appender::non_blocking(Box::new(file) as Box<dyn io::Write + Send>)
        }
    };

    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Json => {
            registry
                .with(fmt::layer().json().with_writer(writer))
                .init();
        }
        LogFormat::Compact => {
            registry
                .with(fmt::layer().compact().with_writer(writer))
                .init();
        }
        LogFormat::Pretty => {
            registry.with(fmt::layer().with_writer(writer)).init();
        }
    }

    Ok(guard)
}
