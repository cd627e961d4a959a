//! Configuration discovery and loading
//!
//! This module handles the configuration discovery hierarchy:
//! 1. Current directory: ./envd.toml
//! 2. User config: ~/.envd/config.toml
//! 3. Built-in defaults

use crate::env;
use serde::{Deserialize, Serialize};
use std::env as std_env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write config file {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("could not determine home directory")]
    NoHomeDir,
}

/// Container-side ports of the optional services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicePorts {
    pub ssh: u16,
    pub jupyter: u16,
    pub rstudio: u16,
}

impl Default for ServicePorts {
    fn default() -> Self {
        Self {
            ssh: env::container::SSH_PORT,
            jupyter: env::container::JUPYTER_PORT,
            rstudio: env::container::RSTUDIO_PORT,
        }
    }
}

/// Process-wide settings for environment containers.
///
/// Everything the lifecycle code would otherwise hard-code lives here so that
/// tests can shrink the polling interval and timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvdConfig {
    /// Readiness polling interval in milliseconds
    pub poll_interval_ms: u64,
    /// Default readiness timeout in seconds
    pub ready_timeout_secs: u64,
    /// Directory the build context is mounted under
    pub home_prefix: String,
    /// User the environment process runs as
    pub user: String,
    /// Loopback IP every port binding is attached to
    pub host_ip: String,
    /// Fixed container-side service ports
    pub ports: ServicePorts,
    /// Image used for the build daemon
    pub buildkitd_image: String,
}

impl Default for EnvdConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: env::container::POLL_INTERVAL_MS,
            ready_timeout_secs: env::container::READY_TIMEOUT_SECS,
            home_prefix: env::container::HOME_PREFIX.to_string(),
            user: env::container::USER.to_string(),
            host_ip: env::container::LOCALHOST.to_string(),
            ports: ServicePorts::default(),
            buildkitd_image: env::container::BUILDKITD_IMAGE.to_string(),
        }
    }
}

impl EnvdConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    /// Load from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save to TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Configuration discovery system
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Discover and load configuration using the hierarchy
    pub fn discover_config() -> Result<EnvdConfig, ConfigError> {
        if let Some(config_path) = Self::find_config_file() {
            info!("Loading configuration from: {:?}", config_path);
            return EnvdConfig::from_toml_file(config_path);
        }

        debug!("No configuration file found, using defaults");
        Ok(EnvdConfig::default())
    }

    /// Find configuration file using discovery hierarchy
    pub fn find_config_file() -> Option<PathBuf> {
        Self::get_config_candidates()
            .into_iter()
            .inspect(|candidate| debug!("Checking for config file: {:?}", candidate))
            .find(|candidate| candidate.is_file())
    }

    /// Get list of configuration file candidates in priority order
    fn get_config_candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if let Ok(current_dir) = std_env::current_dir() {
            candidates.push(env::local_config_file_path(&current_dir));
        }

        if let Some(home_dir) = Self::get_home_dir() {
            candidates.push(env::user_config_file_path(&home_dir));
        }

        candidates
    }

    fn get_home_dir() -> Option<PathBuf> {
        std_env::var("HOME")
            .ok()
            .or_else(|| std_env::var("USERPROFILE").ok())
            .map(PathBuf::from)
    }

    /// Create a default config file in the user's home directory
    pub fn create_default_user_config() -> Result<PathBuf, ConfigError> {
        let home_dir = Self::get_home_dir().ok_or(ConfigError::NoHomeDir)?;

        let config_dir = env::user_config_dir_path(&home_dir);
        let config_path = env::user_config_file_path(&home_dir);

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir).map_err(|source| ConfigError::Write {
                path: config_dir.clone(),
                source,
            })?;
            info!("Created configuration directory: {:?}", config_dir);
        }

        if config_path.exists() {
            warn!("Configuration file already exists: {:?}", config_path);
        } else {
            EnvdConfig::default().to_toml_file(&config_path)?;
            info!("Created default configuration file: {:?}", config_path);
        }

        Ok(config_path)
    }

    /// Show configuration discovery information for debugging
    pub fn show_discovery_info() {
        println!("Configuration Discovery Hierarchy:");
        println!();

        for (i, candidate) in Self::get_config_candidates().iter().enumerate() {
            let status = if candidate.is_file() {
                "✓ EXISTS"
            } else {
                "✗ NOT FOUND"
            };
            println!("  {}. {:?} - {}", i + 1, candidate, status);
        }

        println!();
        match Self::find_config_file() {
            Some(found) => println!("Active configuration: {:?}", found),
            None => println!("Active configuration: Built-in defaults"),
        }
    }
}
