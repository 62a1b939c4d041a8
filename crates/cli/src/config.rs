//! Persistent CLI settings.
//!
//! Settings are resolved with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Settings file (~/.config/rangevit/config.toml)
//! 3. Default values (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_DEVICE: &str = "cpu";
pub const DEFAULT_DTYPE: &str = "f32";
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Persistent settings stored in TOML format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Compute device (cpu, cuda, cuda:N).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    /// Parameter and activation dtype (f32, f16, bf16).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// JSON model config used when a command gets no `--config`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_config: Option<PathBuf>,
}

impl CliConfig {
    /// Get the default settings file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("rangevit").join("config.toml"))
    }

    /// Load settings from the default path, falling back to defaults.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    /// Load settings from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save settings to the default path.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save settings to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Merge with another config, preferring values from `other`.
    pub fn merge(&mut self, other: &CliConfig) {
        if other.device.is_some() {
            self.device = other.device.clone();
        }
        if other.dtype.is_some() {
            self.dtype = other.dtype.clone();
        }
        if other.log_level.is_some() {
            self.log_level = other.log_level.clone();
        }
        if other.model_config.is_some() {
            self.model_config = other.model_config.clone();
        }
    }

    pub fn device_or_default(&self) -> &str {
        self.device.as_deref().unwrap_or(DEFAULT_DEVICE)
    }

    pub fn dtype_or_default(&self) -> &str {
        self.dtype.as_deref().unwrap_or(DEFAULT_DTYPE)
    }

    pub fn log_level_or_default(&self) -> &str {
        self.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }
}

/// Settings file errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("No config directory available")]
    NoConfigDir,
}
