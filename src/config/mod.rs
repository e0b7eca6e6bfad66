//! Configuration management for Strata

pub mod schema;

pub use schema::Config;

use crate::error::{StrataError, StrataResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("strata")
            .join("config.toml")
    }

    /// Get the default cache root (`~/.cache/strata`)
    pub fn default_cache_root() -> PathBuf {
        dirs::cache_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("strata")
    }

    /// Resolve the cache root for a loaded configuration
    pub fn cache_root(config: &Config) -> PathBuf {
        config
            .cache
            .root
            .clone()
            .unwrap_or_else(Self::default_cache_root)
    }

    /// Load configuration, falling back to defaults if the file does not exist
    pub async fn load(&self) -> StrataResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> StrataResult<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| StrataError::io(format!("reading config from {}", path.display()), e))?;

        toml::from_str(&content).map_err(|e| StrataError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
