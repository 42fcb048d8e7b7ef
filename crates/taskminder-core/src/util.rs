//! Shared helper utilities used across Taskminder components.

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

/// `PATH` lookups for the click-through opener, reset whenever `PATH` changes.
#[derive(Default)]
struct ProgramCache {
    path: Option<String>,
    found: HashMap<String, bool>,
}

impl ProgramCache {
    fn get(&mut self, path: Option<&str>, program: &str) -> Option<bool> {
        if self.path.as_deref() != path {
            self.path = path.map(str::to_string);
            self.found.clear();
        }
        self.found.get(program).copied()
    }
}

static PROGRAM_CACHE: OnceLock<Mutex<ProgramCache>> = OnceLock::new();
const DEFAULT_LOG_LIMIT: usize = 120;
const DIAGNOSTIC_LOG_LIMIT: usize = 512;

/// True when `program` is an existing file path or resolves on `PATH`.
pub fn program_in_path(program: &str) -> bool {
    if program.contains(std::path::MAIN_SEPARATOR) {
        return Path::new(program).is_file();
    }
    let search = env::var("PATH").ok();
    let cache = PROGRAM_CACHE.get_or_init(Mutex::default);
    if let Some(hit) = cache
        .lock()
        .ok()
        .and_then(|mut cache| cache.get(search.as_deref(), program))
    {
        return hit;
    }

    let found = search
        .as_deref()
        .is_some_and(|dirs| env::split_paths(dirs).any(|dir| dir.join(program).is_file()));
    if let Ok(mut cache) = cache.lock() {
        cache.found.insert(program.to_string(), found);
    }
    found
}

/// `TASKMINDER_DIAGNOSTIC` raises log snippet limits.
pub fn diagnostic_mode() -> bool {
    diagnostic_mode_from(env::var("TASKMINDER_DIAGNOSTIC").ok().as_deref())
}

fn diagnostic_mode_from(value: Option<&str>) -> bool {
    let value = value.unwrap_or_default().trim().to_ascii_lowercase();
    matches!(value.as_str(), "1" | "true" | "yes" | "on")
}

pub fn log_limit() -> usize {
    log_limit_for(diagnostic_mode())
}

fn log_limit_for(diagnostic: bool) -> usize {
    if diagnostic {
        DIAGNOSTIC_LOG_LIMIT
    } else {
        DEFAULT_LOG_LIMIT
    }
}

/// Flatten line breaks and cap a user-supplied string at `max_len` characters.
pub fn sanitize_log_value(value: &str, max_len: usize) -> String {
    if max_len == 0 {
        return String::new();
    }
    let flattened: String = value
        .chars()
        .take(max_len)
        .map(|ch| if matches!(ch, '\n' | '\r') { ' ' } else { ch })
        .collect();
    let cut = value.chars().nth(max_len).is_some();
    let trimmed = flattened.trim();
    if cut {
        format!("{trimmed}...")
    } else {
        trimmed.to_string()
    }
}

/// Log-safe form of titles, payloads and URLs.
pub fn log_snippet(value: &str) -> String {
    sanitize_log_value(value, log_limit())
}

/// Compact human form of a timer delay, e.g. `24d 20h` or `1m 30s`.
pub fn format_delay(delay: Duration) -> String {
    let total = delay.as_secs();
    if total == 0 {
        return format!("{}ms", delay.as_millis());
    }
    let days = total / 86_400;
    let hours = (total % 86_400) / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    let parts = [(days, "d"), (hours, "h"), (minutes, "m"), (seconds, "s")];
    let rendered: Vec<String> = parts
        .iter()
        .skip_while(|(value, _)| *value == 0)
        .take(2)
        .filter(|(value, _)| *value > 0)
        .map(|(value, unit)| format!("{value}{unit}"))
        .collect();
    rendered.join(" ")
}
