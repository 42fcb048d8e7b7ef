//! Configuration types and defaults for Taskminder.
//!
//! Keeps schema definitions in one place for easier auditing.

use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from config.toml.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Reminder document path; relative paths resolve against the config directory.
    pub tasks_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How late a task reminder may be and still fire on (re)load.
    pub grace_window_ms: u64,
    /// Offset applied when a completed task is reopened.
    pub reschedule_offset_minutes: u64,
    /// Quiet period that coalesces bursts of change signals.
    pub reload_debounce_ms: u64,
    /// Announce successful reloads with a notification.
    pub notify_on_reload: bool,
}

impl SchedulerConfig {
    pub const DEFAULT_GRACE_WINDOW_MS: u64 = 60_000;
    pub const DEFAULT_RESCHEDULE_OFFSET_MINUTES: u64 = 24 * 60;
    pub const DEFAULT_RELOAD_DEBOUNCE_MS: u64 = 250;
    /// Upper bound for `grace_window_ms`: one day.
    pub const MAX_GRACE_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;
    /// Upper bound for `reschedule_offset_minutes`: one year.
    pub const MAX_RESCHEDULE_OFFSET_MINUTES: u64 = 366 * 24 * 60;
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            grace_window_ms: Self::DEFAULT_GRACE_WINDOW_MS,
            reschedule_offset_minutes: Self::DEFAULT_RESCHEDULE_OFFSET_MINUTES,
            reload_debounce_ms: Self::DEFAULT_RELOAD_DEBOUNCE_MS,
            notify_on_reload: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub app_name: String,
    pub app_icon: String,
    /// Passed through to the notification server; -1 lets the server decide.
    pub expire_timeout_ms: i32,
    /// Program used to open click-through URLs.
    pub open_command: String,
    pub link_profile: LinkProfile,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            app_name: "Taskminder".to_string(),
            app_icon: "appointment-soon".to_string(),
            expire_timeout_ms: -1,
            open_command: "xdg-open".to_string(),
            link_profile: LinkProfile::Prod,
        }
    }
}

/// Which app URL from the document click-through navigation targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkProfile {
    Dev,
    #[default]
    Prod,
}
