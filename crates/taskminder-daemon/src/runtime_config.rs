//! Configuration loading and tracing setup.

use std::path::PathBuf;

use anyhow::{Context, Result};
use taskminder_core::Config;
use tracing_subscriber::EnvFilter;

use super::Args;

pub(super) fn load_config(args: &Args) -> Result<Config> {
    match args.config.as_ref() {
        Some(path) => Config::load_from_path(path).context("read config from path"),
        None => Config::load_default().context("read default config"),
    }
}

/// `RUST_LOG` wins over the configured level.
pub(super) fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(
            config
                .general
                .log_level
                .clone()
                .unwrap_or_else(|| "info".to_string()),
        )
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Reminder document path: `--tasks`, then the config, then the data dir.
pub(super) fn tasks_path(args: &Args, config: &Config) -> Result<PathBuf> {
    config
        .resolve_tasks_path(args.tasks.as_deref())
        .context("resolve reminder document path")
}

/// Where the configuration came from, for the startup log line.
pub(super) fn config_source(args: &Args) -> &'static str {
    if args.config.is_some() {
        return "custom";
    }
    match Config::default_config_path() {
        Ok(path) if path.exists() => "default",
        _ => "builtin",
    }
}
