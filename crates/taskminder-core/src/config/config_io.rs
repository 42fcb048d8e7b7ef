//! Configuration loading, path resolution, and on-disk defaults.
//!
//! Focuses on I/O and filesystem-related helpers for config management.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::{Config, SchedulerConfig};

const APP_DIR: &str = "taskminder";
const DOCUMENT_FILE: &str = "tasks.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFailed(String),
    #[error("failed to parse config: {0}")]
    ParseFailed(String),
    #[error("invalid config value: {0}")]
    Invalid(String),
    #[error("missing $HOME, unable to resolve config directory")]
    MissingHome,
}

impl Config {
    /// Load configuration from a specific path.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            fs::read_to_string(path).map_err(|err| ConfigError::ReadFailed(err.to_string()))?;
        let config: Config =
            toml::from_str(&contents).map_err(|err| ConfigError::ParseFailed(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default XDG config location, if present.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = Self::default_config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from_path(&path)
    }

    /// Resolve the reminder document path, preferring an explicit override.
    pub fn resolve_tasks_path(&self, explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        match self.store.tasks_path.as_deref() {
            Some(value) => {
                let base = Self::default_config_dir()?;
                Ok(Self::resolve_path(&base, value))
            }
            None => Ok(Self::default_data_dir()?.join(DOCUMENT_FILE)),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.notifications.open_command.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "notifications.open_command must not be empty".to_string(),
            ));
        }
        if self.store.tasks_path.as_deref().is_some_and(|path| path.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "store.tasks_path must not be empty".to_string(),
            ));
        }
        if self.scheduler.grace_window_ms > SchedulerConfig::MAX_GRACE_WINDOW_MS {
            return Err(ConfigError::Invalid(format!(
                "scheduler.grace_window_ms must be at most {}",
                SchedulerConfig::MAX_GRACE_WINDOW_MS
            )));
        }
        if self.scheduler.reschedule_offset_minutes > SchedulerConfig::MAX_RESCHEDULE_OFFSET_MINUTES {
            return Err(ConfigError::Invalid(format!(
                "scheduler.reschedule_offset_minutes must be at most {}",
                SchedulerConfig::MAX_RESCHEDULE_OFFSET_MINUTES
            )));
        }
        Ok(())
    }

    /// Return the default config directory based on XDG or $HOME.
    pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
        xdg_dir("XDG_CONFIG_HOME", &[".config"])
    }

    /// Return the default data directory holding the reminder document.
    pub fn default_data_dir() -> Result<PathBuf, ConfigError> {
        xdg_dir("XDG_DATA_HOME", &[".local", "share"])
    }

    /// Return the default config file path.
    pub fn default_config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::default_config_dir()?.join("config.toml"))
    }

    fn resolve_path(base: &Path, value: &str) -> PathBuf {
        let path = PathBuf::from(value);
        if path.is_absolute() {
            path
        } else {
            base.join(path)
        }
    }
}

fn xdg_dir(variable: &str, home_fallback: &[&str]) -> Result<PathBuf, ConfigError> {
    if let Ok(dir) = env::var(variable) {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir).join(APP_DIR));
        }
    }
    let home = env::var("HOME").map_err(|_| ConfigError::MissingHome)?;
    let mut path = PathBuf::from(home);
    for part in home_fallback {
        path.push(part);
    }
    Ok(path.join(APP_DIR))
}
