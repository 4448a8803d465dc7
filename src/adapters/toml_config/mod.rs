// TOML config adapter - reads and writes the `[keytrim]` configuration table

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config_initialization::TrimConfig;
use crate::error::{TrimError, TrimResult};

/// On-disk layout: every setting lives under `[keytrim]`
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    keytrim: TrimConfig,
}

/// TOML configuration adapter
#[derive(Debug, Clone, Copy, Default)]
pub struct TomlConfigAdapter;

impl TomlConfigAdapter {
    pub fn new() -> Self {
        Self
    }

    /// Parse a TOML document; missing keys keep their defaults
    pub fn parse(&self, content: &str) -> TrimResult<TrimConfig> {
        let file: ConfigFile = toml::from_str(content).map_err(|e| TrimError::Config {
            message: format!("Failed to parse TOML config: {}", e),
        })?;
        Ok(file.keytrim)
    }

    /// Load configuration from `path`
    pub fn load(&self, path: &Path) -> TrimResult<TrimConfig> {
        let content = fs::read_to_string(path).map_err(|e| TrimError::Config {
            message: format!("Failed to read config file {}: {}", path.display(), e),
        })?;
        let config = self.parse(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Render `config` as a TOML document
    pub fn serialize(&self, config: &TrimConfig) -> TrimResult<String> {
        toml::to_string_pretty(&ConfigFile {
            keytrim: config.clone(),
        })
        .map_err(|e| TrimError::Config {
            message: format!("Failed to serialize config: {}", e),
        })
    }

    /// Write `config` to `path`, creating parent directories
    pub fn save(&self, config: &TrimConfig, path: &Path) -> TrimResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.serialize(config)?)?;
        Ok(())
    }
}
