//! Runtime error types.

use crate::config::ConfigError;
use statechart_core::CoreError;
use thiserror::Error;

/// Runtime errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("no tokio runtime available: {0}")]
    NoReactor(String),

    #[error("machine runtime shut down")]
    ShutDown,
}

impl RuntimeError {
    /// Stable code for logs and embedders.
    pub fn error_code(&self) -> &'static str {
        match self {
            RuntimeError::Core(e) => e.error_code(),
            RuntimeError::Config(_) => "CONFIG_ERROR",
            RuntimeError::NoReactor(_) => "NO_REACTOR",
            RuntimeError::ShutDown => "SHUT_DOWN",
        }
    }

    /// Returns whether retrying the call can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RuntimeError::Core(CoreError::NotRunning))
    }
}
