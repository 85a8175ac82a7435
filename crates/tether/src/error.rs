//! Error types for the tether core.

use tether_runtime::RuntimeError;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(std::path::PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised by the process-wide lifecycle state.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("A process lifecycle state is already installed")]
    AlreadyInstalled,
}

/// Errors raised while starting or stopping a [`TetherContext`](crate::TetherContext).
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}
