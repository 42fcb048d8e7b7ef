//! Reminder document model shared by the daemon and the control CLI.

use chrono::{DateTime, Duration, Local, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::LinkProfile;

pub const DEFAULT_ENTRY_TITLE: &str = "Reminder";
pub const DEFAULT_TASK_TITLE: &str = "Task Reminder";
pub const DEFAULT_ROUTE: &str = "/";
/// Dev server used when the document does not name one.
pub const DEFAULT_DEV_URL: &str = "http://localhost:5173/";

/// Recurring reminder definition from the `items` array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub every_minutes: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<String>,
    /// Keys the scheduler does not interpret, kept for write-back.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ScheduleEntry {
    /// Registry key for this entry; entries without a usable id never arm.
    pub fn key(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn reminder(&self) -> Reminder {
        Reminder::new(
            non_empty(self.title.as_deref()).unwrap_or(DEFAULT_ENTRY_TITLE),
            self.message.as_deref().unwrap_or_default(),
            non_empty(self.route.as_deref()).unwrap_or(DEFAULT_ROUTE),
        )
    }
}

/// One-off to-do item with an optional reminder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<String>,
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub remove: bool,
    #[serde(default, rename = "reschedule_after_completed")]
    pub reschedule_after_completed: bool,
    #[serde(default, rename = "notify_pressed")]
    pub notify_pressed: bool,
    /// Set when the user picked the deadline explicitly.
    #[serde(default, rename = "deadline_pressed")]
    pub deadline_pressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entered_date: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    /// Parsed reminder time, if the stored value is a valid timestamp.
    pub fn fire_time(&self) -> Option<DateTime<Utc>> {
        self.notification_date.as_deref().and_then(parse_timestamp)
    }

    /// Soft-deleted tasks never arm; finished ones only when they reschedule.
    pub fn is_schedulable(&self) -> bool {
        !self.remove && (!self.finished || self.reschedule_after_completed)
    }

    pub fn wants_reschedule(&self) -> bool {
        self.reschedule_after_completed && self.finished
    }

    /// Registry key: the stored id, or a positional id stable within one read.
    pub fn timer_id(&self, index: usize, at: DateTime<Utc>) -> String {
        match self.id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => format!("task-{index}-{}", at.timestamp_millis()),
        }
    }

    pub fn reminder(&self) -> Reminder {
        Reminder::new(
            non_empty(self.name.as_deref()).unwrap_or(DEFAULT_TASK_TITLE),
            self.details.as_deref().unwrap_or_default(),
            DEFAULT_ROUTE,
        )
    }
}

/// Reopen a completed task object for another round `offset` after `now`.
///
/// Only the scheduling keys are rewritten; everything else in the object is left
/// as found. Returns the new reminder time, or `None` if it is out of range.
pub fn reopen_task(
    task: &mut Map<String, Value>,
    now: DateTime<Utc>,
    offset: Duration,
) -> Option<DateTime<Utc>> {
    let next = now.checked_add_signed(offset)?;
    let stamp = format_timestamp(next);
    let deadline_pressed = task
        .get("deadline_pressed")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    task.insert("finished".to_string(), Value::Bool(false));
    task.insert("remove".to_string(), Value::Bool(false));
    task.insert("enteredDate".to_string(), Value::String(format_timestamp(now)));
    if !deadline_pressed {
        task.insert("deadline".to_string(), Value::String(stamp.clone()));
    }
    task.insert("notificationDate".to_string(), Value::String(stamp));
    Some(next)
}

/// Persisted document: recurring entries, tasks and app URLs.
///
/// `items` and `tasks` hold the elements exactly as stored. They are parsed one at
/// a time when the schedule is armed, so an element the scheduler cannot read is
/// skipped but never dropped from the file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    #[serde(default, deserialize_with = "element_list")]
    pub items: Vec<Value>,
    #[serde(default, deserialize_with = "element_list")]
    pub tasks: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_url_dev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_url_prod: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConfigDocument {
    /// Parsed recurring entries by position; `None` where an element is malformed.
    pub fn schedule_entries(&self) -> Vec<Option<ScheduleEntry>> {
        parse_elements(&self.items, "items")
    }

    /// Parsed tasks by position; `None` where an element is malformed.
    pub fn task_entries(&self) -> Vec<Option<Task>> {
        parse_elements(&self.tasks, "tasks")
    }

    /// Base URL for click-through navigation under the given profile.
    pub fn app_url(&self, profile: LinkProfile) -> Option<String> {
        match profile {
            LinkProfile::Dev => Some(
                non_empty(self.app_url_dev.as_deref())
                    .unwrap_or(DEFAULT_DEV_URL)
                    .to_string(),
            ),
            LinkProfile::Prod => non_empty(self.app_url_prod.as_deref()).map(str::to_string),
        }
    }
}

/// Payload handed to the notification sink when a timer fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminder {
    pub title: String,
    pub message: String,
    pub route: String,
}

impl Reminder {
    pub fn new(title: &str, message: &str, route: &str) -> Self {
        Self {
            title: title.to_string(),
            message: message.to_string(),
            route: route.to_string(),
        }
    }
}

/// Build the hash-routed URL the UI understands, e.g. `base#/tasks`.
pub fn route_url(base: &str, route: &str) -> String {
    let route = route.trim();
    if route.starts_with('/') {
        format!("{base}#{route}")
    } else {
        format!("{base}#/{route}")
    }
}

/// Parse an ISO-8601 timestamp. Values without an offset are local wall-clock time.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|local| local.with_timezone(&Utc));
        }
    }
    None
}

/// Millisecond precision UTC, the shape the UI writes.
pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.trim().is_empty())
}

fn element_list<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Array(values) => Ok(values),
        other => {
            debug!(kind = %json_kind(&other), "document list is not an array; treating as empty");
            Ok(Vec::new())
        }
    }
}

fn parse_elements<T: DeserializeOwned>(values: &[Value], list: &str) -> Vec<Option<T>> {
    values
        .iter()
        .enumerate()
        .map(|(index, value)| match T::deserialize(value) {
            Ok(item) => Some(item),
            Err(err) => {
                debug!(list, index, %err, "skipping malformed document element");
                None
            }
        })
        .collect()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
