use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::domain::models::LoggingConfig;

const LOG_FILE_PREFIX: &str = "patchgrade.log";

/// Console output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn parse(format: &str) -> Result<Self> {
        match format.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            _ => anyhow::bail!("Invalid log format: {format}"),
        }
    }
}

/// Logger implementation using tracing
///
/// Console logs go to stderr so stdout stays free for command output.
pub struct LoggerImpl {
    _guard: Option<WorkerGuard>,
}

impl LoggerImpl {
    /// Initialize the global subscriber.
    ///
    /// `RUST_LOG` overrides the configured level. With `log_dir` set, a daily
    /// rolling JSON file is written as well; the returned logger must be kept
    /// alive for the file writer to flush.
    pub fn init(config: &LoggingConfig) -> Result<Self> {
        let level = parse_log_level(&config.level)?;
        let format = LogFormat::parse(&config.format)?;

        let (json_layer, pretty_layer) = match format {
            LogFormat::Json => (
                Some(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(io::stderr)
                        .with_current_span(true)
                        .with_target(true)
                        .with_filter(env_filter(level)),
                ),
                None,
            ),
            LogFormat::Pretty => (
                None,
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_target(false)
                        .compact()
                        .with_filter(env_filter(level)),
                ),
            ),
        };

        let (file_layer, guard) = match config.log_dir.as_deref() {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create log directory {dir}"))?;
                let appender = rolling::daily(Path::new(dir), LOG_FILE_PREFIX);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_filter(env_filter(level));
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        tracing_subscriber::registry()
            .with(json_layer)
            .with(pretty_layer)
            .with(file_layer)
            .try_init()
            .context("Failed to install tracing subscriber")?;

        tracing::debug!(
            level = %config.level,
            format = ?format,
            file_output = config.log_dir.is_some(),
            "logger initialized"
        );

        Ok(Self { _guard: guard })
    }
}

fn env_filter(default_level: Level) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy()
}

/// Parse log level string to Level
fn parse_log_level(level: &str) -> Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => anyhow::bail!("Invalid log level: {level}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("info"), Ok(Level::INFO)));
        assert!(matches!(parse_log_level("WARN"), Ok(Level::WARN)));
        assert!(parse_log_level("invalid").is_err());
    }

    #[test]
    fn test_parse_log_format() {
        assert_eq!(LogFormat::parse("json").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::parse("Pretty").unwrap(), LogFormat::Pretty);
        assert!(LogFormat::parse("xml").is_err());
    }

    #[test]
    fn test_logger_init_rejects_bad_level_before_installing() {
        let config = LoggingConfig {
            level: "loud".to_string(),
            ..LoggingConfig::default()
        };
        assert!(LoggerImpl::init(&config).is_err());
    }

    #[test]
    fn test_logger_init_with_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            level: "debug".to_string(),
            format: "json".to_string(),
            log_dir: Some(dir.path().join("logs").display().to_string()),
        };

        // Another test may already own the global subscriber; the directory
        // is created either way.
        let _ = LoggerImpl::init(&config);
        assert!(dir.path().join("logs").is_dir());
    }
}
