//! Configuration initialization and hierarchy management
//!
//! Precedence, lowest first: defaults, TOML file, environment, CLI flags.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::adapters::toml_config::TomlConfigAdapter;
use crate::domain::model::StreamSelection;
use crate::engine::{EngineOptions, StreamCopyBackend, DEFAULT_BUFFER_SIZE, DEFAULT_CHUNK_DURATION_MS};
use crate::error::{TrimError, TrimResult};
use crate::utils::logging::{parse_filter, LogFormat, LoggingConfig};

/// Config file looked up in the working directory when none is given
pub const DEFAULT_CONFIG_FILE: &str = "keytrim.toml";

/// Smallest accepted stream-copy buffer
pub const MIN_BUFFER_SIZE: usize = 4096;

/// Environment variable -> config key
pub const ENV_MAPPINGS: &[(&str, &str)] = &[
    ("KEYTRIM_WORKER_THREADS", "worker_threads"),
    ("KEYTRIM_RETAIN_AUDIO", "retain_audio"),
    ("KEYTRIM_RETAIN_VIDEO", "retain_video"),
    ("KEYTRIM_BUFFER_SIZE", "default_buffer_size"),
    ("KEYTRIM_CHUNK_DURATION_MS", "chunk_duration_ms"),
    ("KEYTRIM_LOG_LEVEL", "log_level"),
    ("KEYTRIM_LOG_FORMAT", "log_format"),
    ("KEYTRIM_BACKEND", "backend"),
];

/// Effective settings for one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrimConfig {
    pub worker_threads: usize,
    pub retain_audio: bool,
    pub retain_video: bool,
    pub default_buffer_size: usize,
    pub chunk_duration_ms: u64,
    pub log_level: String,
    pub log_format: LogFormat,
    pub backend: StreamCopyBackend,
}

impl Default for TrimConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get(),
            retain_audio: true,
            retain_video: true,
            default_buffer_size: DEFAULT_BUFFER_SIZE,
            chunk_duration_ms: DEFAULT_CHUNK_DURATION_MS,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            backend: StreamCopyBackend::Native,
        }
    }
}

impl TrimConfig {
    /// Set one key from its string form
    pub fn set(&mut self, key: &str, value: &str) -> TrimResult<()> {
        let value = value.trim();
        match key {
            "worker_threads" => self.worker_threads = parse_number(key, value)?,
            "retain_audio" => self.retain_audio = parse_bool(key, value)?,
            "retain_video" => self.retain_video = parse_bool(key, value)?,
            "default_buffer_size" => self.default_buffer_size = parse_number(key, value)?,
            "chunk_duration_ms" => self.chunk_duration_ms = parse_number(key, value)?,
            "log_level" => self.log_level = value.to_string(),
            "log_format" => self.log_format = value.parse()?,
            "backend" => {
                self.backend = value.parse().map_err(|message| TrimError::Config { message })?
            }
            other => {
                return Err(TrimError::Config {
                    message: format!("unknown configuration key '{}'", other),
                })
            }
        }
        Ok(())
    }

    /// Reject values no component can work with
    pub fn validate(&self) -> TrimResult<()> {
        if self.worker_threads == 0 {
            return Err(config_error("worker_threads must be at least 1"));
        }
        if self.default_buffer_size < MIN_BUFFER_SIZE {
            return Err(config_error(format!(
                "default_buffer_size must be at least {} bytes",
                MIN_BUFFER_SIZE
            )));
        }
        if self.chunk_duration_ms == 0 {
            return Err(config_error("chunk_duration_ms must be positive"));
        }
        if !self.retain_audio && !self.retain_video {
            return Err(config_error("at least one of retain_audio/retain_video must be set"));
        }
        if !self.backend.is_available() {
            return Err(config_error(format!(
                "backend {:?} requires the `libav` feature",
                self.backend
            )));
        }
        parse_filter(&self.log_level)?;
        Ok(())
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            default_buffer_size: self.default_buffer_size,
            chunk_duration_ms: self.chunk_duration_ms,
            backend: self.backend,
        }
    }

    pub fn selection(&self) -> StreamSelection {
        StreamSelection::new(self.retain_audio, self.retain_video)
    }

    pub fn logging(&self) -> LoggingConfig {
        LoggingConfig::new(self.log_level.clone(), self.log_format)
    }
}

/// Values given on the command line; `None` leaves the lower layers alone
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub worker_threads: Option<usize>,
    pub retain_audio: Option<bool>,
    pub retain_video: Option<bool>,
}

/// Build the effective configuration from every layer
pub fn initialize_configuration_hierarchy(overrides: &ConfigOverrides) -> TrimResult<TrimConfig> {
    let mut config = load_config_file(overrides.config_path.as_deref())?;
    apply_environment(&mut config, |key| std::env::var(key).ok())?;
    apply_cli_overrides(&mut config, overrides);
    config.validate()?;
    debug!("Effective configuration: {:?}", config);
    Ok(config)
}

/// Defaults merged with the TOML file, if any.
///
/// An explicit path must exist; the default file is optional.
pub fn load_config_file(explicit: Option<&Path>) -> TrimResult<TrimConfig> {
    let adapter = TomlConfigAdapter::new();
    match explicit {
        Some(path) => adapter.load(path),
        None => {
            let path = Path::new(DEFAULT_CONFIG_FILE);
            if path.is_file() {
                adapter.load(path)
            } else {
                Ok(TrimConfig::default())
            }
        }
    }
}

/// Apply `KEYTRIM_*` variables found through `lookup`
pub fn apply_environment<F>(config: &mut TrimConfig, lookup: F) -> TrimResult<usize>
where
    F: Fn(&str) -> Option<String>,
{
    let mut applied = 0;
    for &(var, key) in ENV_MAPPINGS {
        if let Some(value) = lookup(var) {
            config.set(key, &value).map_err(|e| match e {
                TrimError::Config { message } => config_error(format!("{}: {}", var, message)),
                other => other,
            })?;
            debug!("Environment override: {} = {}", var, value);
            applied += 1;
        }
    }
    Ok(applied)
}

pub fn apply_cli_overrides(config: &mut TrimConfig, overrides: &ConfigOverrides) {
    if let Some(level) = &overrides.log_level {
        config.log_level = level.clone();
    }
    if let Some(format) = overrides.log_format {
        config.log_format = format;
    }
    if let Some(threads) = overrides.worker_threads {
        config.worker_threads = threads;
    }
    if let Some(audio) = overrides.retain_audio {
        config.retain_audio = audio;
    }
    if let Some(video) = overrides.retain_video {
        config.retain_video = video;
    }
}

fn config_error(message: impl Into<String>) -> TrimError {
    TrimError::Config {
        message: message.into(),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> TrimResult<T> {
    value
        .parse()
        .map_err(|_| config_error(format!("{} expects a non-negative integer, got '{}'", key, value)))
}

fn parse_bool(key: &str, value: &str) -> TrimResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(config_error(format!("{} expects a boolean, got '{}'", key, value))),
    }
}
