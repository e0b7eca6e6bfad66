//! Configuration schema for Strata
//!
//! Configuration is stored at `~/.config/strata/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Cache directory settings
    pub cache: CacheConfig,

    /// Named lock settings
    pub lock: LockConfig,

    /// Container engine settings
    pub container: ContainerConfig,

    /// Pull/push retry settings
    pub distribution: DistributionConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Cache directory settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache root; defaults to the platform cache dir
    pub root: Option<PathBuf>,
}

/// Named lock settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// How long to wait for a contended lock before giving up
    pub timeout_secs: u64,

    /// Delay between acquisition attempts
    pub poll_interval_ms: u64,
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            poll_interval_ms: 200,
        }
    }
}

/// Container engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Engine binary: "docker" or "podman"
    pub binary: String,

    /// Shell used for interactive introspection sessions
    pub introspect_shell: String,

    /// Print the full run command before each stage build
    pub debug_run_command: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            introspect_shell: "/bin/sh".to_string(),
            debug_run_command: false,
        }
    }
}

/// Pull/push retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_backoff_ms: u64,

    /// Upper bound for the doubling backoff
    pub max_backoff_ms: u64,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
[container]
binary = "podman"

[lock]
timeout_secs = 5
"#,
        )
        .unwrap();

        assert_eq!(config.container.binary, "podman");
        assert_eq!(config.container.introspect_shell, "/bin/sh");
        assert_eq!(config.lock.timeout(), Duration::from_secs(5));
        assert_eq!(config.lock.poll_interval_ms, 200);
        assert_eq!(config.distribution.max_attempts, 5);
        assert!(config.cache.root.is_none());
    }

    #[test]
    fn poll_interval_never_zero() {
        let lock = LockConfig {
            timeout_secs: 1,
            poll_interval_ms: 0,
        };
        assert_eq!(lock.poll_interval(), Duration::from_millis(1));
    }
}
