//! Configuration Types
//!
//! Every knob has a default, so an empty file (or no file) is a valid config.
//!
//! ```toml
//! [runner]
//! thread_name = "tether-interp"
//!
//! [cache]
//! capacity = 32
//! auto_purge_count = 256
//! auto_purge_interval_ms = 1000
//!
//! [executor]
//! barrier_watchdog_ms = 30000
//!
//! [lifecycle]
//! start_in_background = false
//! fire_once_on_background = true
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::lifecycle::AppState;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TetherConfig {
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

impl TetherConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: TetherConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "Loaded tether config");
        Ok(config)
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runner.thread_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "runner.thread_name must not be empty".to_string(),
            ));
        }
        if self.cache.auto_purge_count == 0 {
            return Err(ConfigError::Invalid(
                "cache.auto_purge_count must be at least 1".to_string(),
            ));
        }
        if self.executor.barrier_watchdog_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "executor.barrier_watchdog_ms must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Interpreter runner thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            thread_name: default_thread_name(),
        }
    }
}

fn default_thread_name() -> String {
    "tether-interp".to_string()
}

/// Weak identity cache tuning
///
/// Purging only happens once both thresholds have been crossed. The defaults
/// trade a little memory for fewer scans; neither is needed for correctness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Strong references kept alive regardless of outside use
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Accesses between automatic purges
    #[serde(default = "default_auto_purge_count")]
    pub auto_purge_count: usize,
    /// Minimum time between automatic purges
    #[serde(default = "default_auto_purge_interval_ms")]
    pub auto_purge_interval_ms: u64,
}

impl CacheConfig {
    pub fn auto_purge_interval(&self) -> Duration {
        Duration::from_millis(self.auto_purge_interval_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            auto_purge_count: default_auto_purge_count(),
            auto_purge_interval_ms: default_auto_purge_interval_ms(),
        }
    }
}

fn default_capacity() -> usize {
    32
}

fn default_auto_purge_count() -> usize {
    256
}

fn default_auto_purge_interval_ms() -> u64 {
    1000
}

/// Keyed serial executor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Warn about barriers held longer than this. Absent disables the check.
    #[serde(default)]
    pub barrier_watchdog_ms: Option<u64>,
}

impl ExecutorConfig {
    pub fn barrier_watchdog(&self) -> Option<Duration> {
        self.barrier_watchdog_ms.map(Duration::from_millis)
    }
}

/// Application lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default)]
    pub start_in_background: bool,
    /// Timers fire once, immediately, when the app is backgrounded
    #[serde(default = "default_true")]
    pub fire_once_on_background: bool,
}

impl LifecycleConfig {
    pub fn initial_state(&self) -> AppState {
        if self.start_in_background {
            AppState::Background
        } else {
            AppState::Foreground
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            start_in_background: false,
            fire_once_on_background: true,
        }
    }
}

fn default_true() -> bool {
    true
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
