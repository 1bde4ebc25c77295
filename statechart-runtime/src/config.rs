//! Runtime configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via STATECHART_CONFIG or --config)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use statechart_core::RestorePolicy;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Interpreter behavior.
    pub machine: MachineConfig,
    /// Owning task and notification settings.
    pub runtime: RuntimeConfig,
    /// Logging defaults.
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Like [`Config::load`], reading `path` instead of STATECHART_CONFIG when given.
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match std::env::var("STATECHART_CONFIG") {
                Ok(path) => Self::from_file(&path)?,
                Err(_) => Self::default(),
            },
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.machine.apply_env_overrides();
        self.runtime.apply_env_overrides();
        self.logging.apply_env_overrides();
    }

    /// Checks values serde cannot reject on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runtime.notification_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "runtime.notification_capacity must be at least 1".to_string(),
            ));
        }
        if self.logging.filter.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "logging.filter must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Interpreter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Whether exited states give back the property values they overwrote.
    pub restore_policy: RestorePolicy,
}

impl MachineConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(policy) = std::env::var("STATECHART_RESTORE_POLICY") {
            self.restore_policy = match policy.to_lowercase().as_str() {
                "restore" | "restore_properties" => RestorePolicy::RestoreProperties,
                _ => RestorePolicy::DontRestoreProperties,
            };
        }
    }
}

/// Owning task configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Capacity of the notification broadcast channel.
    pub notification_capacity: usize,
    /// End the owning task once a run finishes or stops.
    pub exit_on_finish: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            notification_capacity: 1024,
            exit_on_finish: false,
        }
    }
}

impl RuntimeConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(capacity) = std::env::var("STATECHART_NOTIFICATION_CAPACITY") {
            if let Ok(n) = capacity.parse() {
                self.notification_capacity = n;
            }
        }

        if let Ok(exit) = std::env::var("STATECHART_EXIT_ON_FINISH") {
            self.exit_on_finish = exit == "1" || exit.to_lowercase() == "true";
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Tracing filter used when RUST_LOG is not set.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(filter) = std::env::var("STATECHART_LOG") {
            if !filter.is_empty() {
                self.filter = filter;
            }
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    IoError(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    ParseError(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}
