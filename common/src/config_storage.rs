//! Configuration file I/O operations.

use crate::config::AppConfig;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    ReadError(#[from] io::Error),

    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

/// A TOML-backed configuration store at a fixed path.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new(AppConfig::config_file())
    }
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored configuration; a missing file yields defaults.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        load_config_from(&self.path)
    }

    pub fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        save_config_to(config, &self.path)
    }
}

/// Load configuration from the default location
pub fn load_config() -> Result<AppConfig, ConfigError> {
    ConfigStore::default().load()
}

/// Load configuration from a specific path
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("No configuration at {:?}, using defaults", path);
        return Ok(AppConfig::default());
    }

    let contents = fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&contents)?;
    tracing::info!("Configuration loaded from {:?}", path);
    Ok(config)
}

/// Save configuration to the default location
pub fn save_config(config: &AppConfig) -> Result<(), ConfigError> {
    ConfigStore::default().save(config)
}

/// Save configuration to a specific path
pub fn save_config_to(config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let contents = toml::to_string_pretty(config)?;
    fs::write(path, contents)?;
    tracing::info!("Configuration saved to {:?}", path);
    Ok(())
}
