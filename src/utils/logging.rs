//! Logging configuration and subscriber installation

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::error::{TrimError, TrimResult};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable multi-line format
    #[default]
    Pretty,
    /// Single-line text format
    Compact,
    /// JSON format for structured logging
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogFormat::Pretty => "pretty",
            LogFormat::Compact => "compact",
            LogFormat::Json => "json",
        })
    }
}

impl FromStr for LogFormat {
    type Err = TrimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(TrimError::Config {
                message: format!("unknown log format '{}'", other),
            }),
        }
    }
}

/// Logging configuration options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset (`info`, `keytrim=debug`, ...)
    pub level: String,
    pub format: LogFormat,
    /// Include target module information
    pub target: bool,
    /// Include thread names
    pub thread_names: bool,
    /// Use colored output
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            target: false,
            thread_names: false,
            ansi: true,
        }
    }
}

impl LoggingConfig {
    pub fn new(level: impl Into<String>, format: LogFormat) -> Self {
        Self {
            level: level.into(),
            format,
            ..Self::default()
        }
    }

    /// Build the filter: `RUST_LOG` wins, else the configured level
    pub fn env_filter(&self) -> TrimResult<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => parse_filter(&self.level),
        }
    }
}

/// Parse a filter directive, reporting bad ones as configuration errors
pub fn parse_filter(directive: &str) -> TrimResult<EnvFilter> {
    EnvFilter::try_new(directive).map_err(|e| TrimError::Config {
        message: format!("invalid log level '{}': {}", directive, e),
    })
}

/// Install the global subscriber; logs go to stderr
pub fn init_logging(config: &LoggingConfig) -> TrimResult<()> {
    let filter = config.env_filter()?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(config.target)
        .with_thread_names(config.thread_names);

    let installed = match config.format {
        LogFormat::Pretty => builder.with_ansi(config.ansi).pretty().try_init(),
        LogFormat::Compact => builder.with_ansi(config.ansi).compact().try_init(),
        LogFormat::Json => builder.with_ansi(false).json().try_init(),
    };
    installed.map_err(|e| TrimError::Config {
        message: format!("logging already initialized: {}", e),
    })?;

    tracing::debug!("Logging initialized ({} format, level {})", config.format, config.level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_filter_directives() {
        assert!(parse_filter("debug").is_ok());
        assert!(parse_filter("keytrim=trace,warn").is_ok());
        assert!(parse_filter("keytrim=loud").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Pretty);
    }
}
