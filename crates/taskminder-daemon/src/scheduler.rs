//! Reminder scheduling: recurring entries, one-shot tasks and rebuilds.
//!
//! One task owns the store, the timer registry and the sink. Timer wake-ups,
//! change signals and control requests are all handled on that task, so a
//! rebuild can never interleave with a fire.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Local, Utc};
use serde_json::Value;
use taskminder_core::util::{format_delay, log_snippet};
use taskminder_core::{
    format_timestamp, next_fire_time, plan_one_shot, reopen_task, OneShotPlan, Reminder,
    ScheduleEntry, ScheduleKind, ScheduleState, SchedulerConfig, Task, DEFAULT_ROUTE,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::sink::NotificationSink;
use crate::store::{ChangeSignal, DocumentStore, StoreError};
use crate::timers::{max_timer_delay, FiredTimer, TimerRegistry};

/// Wall-clock source; swapped out in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub grace_window: Duration,
    pub reschedule_offset: Duration,
    pub reload_debounce: StdDuration,
    pub notify_on_reload: bool,
}

impl SchedulerSettings {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        let signed = |value: u64| i64::try_from(value).unwrap_or(i64::MAX);
        Self {
            grace_window: Duration::try_milliseconds(signed(config.grace_window_ms))
                .unwrap_or_else(|| Duration::minutes(1)),
            reschedule_offset: Duration::try_minutes(signed(config.reschedule_offset_minutes))
                .unwrap_or_else(|| Duration::days(1)),
            reload_debounce: StdDuration::from_millis(config.reload_debounce_ms),
            notify_on_reload: config.notify_on_reload,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler is not running")]
    Stopped,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a timer does when it fires.
#[derive(Debug, Clone)]
pub enum TimerAction {
    Recurring { kind: ScheduleKind, reminder: Reminder },
    Task { index: usize, at: DateTime<Utc>, task: Task },
}

/// Counts from one rebuild pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildSummary {
    pub armed: usize,
    pub entries: usize,
    pub tasks: usize,
    pub skipped: usize,
    pub fire_now: usize,
}

/// Requests served by the scheduler task.
pub enum SchedulerCommand {
    Read {
        reply: oneshot::Sender<Value>,
    },
    Write {
        payload: Value,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Rebuild {
        reply: oneshot::Sender<ScheduleState>,
    },
    Deliver {
        reminder: Reminder,
    },
    Shutdown,
}

enum TaskArm {
    Armed,
    FireNow,
    Skipped,
}

pub struct Scheduler {
    store: DocumentStore,
    registry: TimerRegistry<TimerAction>,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    // Task reminders already shown, by timer id, so the grace window does not repeat them.
    delivered: HashMap<String, DateTime<Utc>>,
    state: watch::Sender<ScheduleState>,
    rebuilds: u64,
}

impl Scheduler {
    pub fn new(
        store: DocumentStore,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Self {
        let (state, _) = watch::channel(ScheduleState::default());
        Self {
            store,
            registry: TimerRegistry::new(),
            sink,
            clock,
            settings,
            delivered: HashMap::new(),
            state,
            rebuilds: 0,
        }
    }

    /// Spawn the scheduler loop. It rebuilds once before serving anything else.
    pub fn start(
        self,
        changes: mpsc::UnboundedReceiver<ChangeSignal>,
    ) -> (SchedulerHandle, JoinHandle<()>) {
        let (sender, commands) = mpsc::unbounded_channel();
        let handle = SchedulerHandle {
            sender,
            state: self.state.subscribe(),
        };
        let task = tokio::spawn(self.run(commands, changes));
        (handle, task)
    }

    #[cfg(test)]
    pub fn armed(&self) -> usize {
        self.registry.len()
    }

    #[cfg(test)]
    pub fn registry(&self) -> &TimerRegistry<TimerAction> {
        &self.registry
    }

    /// Cancel every timer and re-derive the schedule from the current document.
    #[cfg(test)]
    pub fn rebuild(&mut self) -> RebuildSummary {
        self.rebuild_checked().0
    }

    fn rebuild_checked(&mut self) -> (RebuildSummary, Option<StoreError>) {
        let cleared = self.registry.clear_all();
        let (document, fallback) = self.store.read_checked();
        let now = self.clock.now();
        let mut summary = RebuildSummary {
            entries: document.items.len(),
            tasks: document.tasks.len(),
            ..RebuildSummary::default()
        };

        for entry in document.schedule_entries() {
            let armed = entry.is_some_and(|entry| self.arm_entry(&entry, now));
            if !armed {
                summary.skipped += 1;
            }
        }
        // Positions count malformed elements too, matching the stored list.
        for (index, task) in document.task_entries().into_iter().enumerate() {
            let arm = match task {
                Some(task) => self.arm_task(index, &task, now),
                None => TaskArm::Skipped,
            };
            match arm {
                TaskArm::Armed => {}
                TaskArm::FireNow => summary.fire_now += 1,
                TaskArm::Skipped => summary.skipped += 1,
            }
        }
        summary.armed = self.registry.len();
        self.rebuilds += 1;
        self.publish_state(now, &summary);
        info!(
            cleared,
            armed = summary.armed,
            entries = summary.entries,
            tasks = summary.tasks,
            skipped = summary.skipped,
            fire_now = summary.fire_now,
            "reminder schedule rebuilt"
        );
        (summary, fallback)
    }

    fn arm_entry(&mut self, entry: &ScheduleEntry, now: DateTime<Utc>) -> bool {
        let Some(id) = entry.key() else {
            debug!("skipping schedule entry without id");
            return false;
        };
        let Some(kind) = ScheduleKind::from_entry(entry) else {
            debug!(id, "skipping schedule entry without a valid recurrence");
            return false;
        };
        self.arm_recurring(id.to_string(), kind, entry.reminder(), now)
    }

    fn arm_recurring(
        &mut self,
        id: String,
        kind: ScheduleKind,
        reminder: Reminder,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(target) = next_fire_time(&kind, &now.with_timezone(&Local)) else {
            warn!(id = %id, ?kind, "no next fire time for recurring reminder");
            return false;
        };
        debug!(
            id = %id,
            ?kind,
            delay = %describe_delay(target - now),
            "recurring reminder armed"
        );
        self.registry
            .set(id, target, now, TimerAction::Recurring { kind, reminder });
        true
    }

    fn arm_task(&mut self, index: usize, task: &Task, now: DateTime<Utc>) -> TaskArm {
        if !task.is_schedulable() {
            return TaskArm::Skipped;
        }
        let Some(at) = task.fire_time() else {
            debug!(index, "skipping task without a valid notificationDate");
            return TaskArm::Skipped;
        };
        let id = task.timer_id(index, at);
        let action = TimerAction::Task {
            index,
            at,
            task: task.clone(),
        };
        match plan_one_shot(at, now, self.settings.grace_window) {
            OneShotPlan::Future(target) => {
                debug!(id = %id, delay = %describe_delay(target - now), "task reminder armed");
                self.registry.set(id, target, now, action);
                TaskArm::Armed
            }
            OneShotPlan::FireNow => {
                if self.delivered.get(&id) == Some(&at) {
                    debug!(id = %id, "task reminder already delivered");
                    return TaskArm::Skipped;
                }
                debug!(id = %id, late = %describe_delay(now - at), "task reminder within grace window");
                self.registry.set(id, now, now, action);
                TaskArm::FireNow
            }
            OneShotPlan::Missed => {
                debug!(id = %id, "task reminder missed; not scheduling");
                TaskArm::Skipped
            }
        }
    }

    /// Fire every timer whose target has been reached. Returns how many fired.
    pub fn fire_due(&mut self) -> usize {
        let now = self.clock.now();
        let fired = self.registry.pop_due(now);
        let count = fired.len();
        for timer in fired {
            self.handle_fired(timer, now);
        }
        if count > 0 {
            self.prune_delivered(now);
        }
        count
    }

    fn handle_fired(&mut self, timer: FiredTimer<TimerAction>, now: DateTime<Utc>) {
        debug!(id = %timer.id, target = %timer.target, links = timer.links, "timer fired");
        match timer.payload {
            TimerAction::Recurring { kind, reminder } => {
                self.deliver(&timer.id, reminder.clone());
                self.arm_recurring(timer.id, kind, reminder, now);
            }
            TimerAction::Task { index, at, task } => {
                self.deliver(&timer.id, task.reminder());
                self.delivered.insert(timer.id.clone(), at);
                if task.wants_reschedule() {
                    if let Err(err) = self.reschedule_after_completion(index, &task, now) {
                        warn!(id = %timer.id, %err, "failed to reschedule completed task");
                    }
                }
            }
        }
    }

    /// Reopen a completed task in the stored document. Only that task's object
    /// is edited. The resulting write raises a change signal; the next rebuild
    /// arms the new reminder.
    fn reschedule_after_completion(
        &mut self,
        index: usize,
        fired: &Task,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut document = self.store.read_current()?;
        let Some(tasks) = document.get_mut("tasks").and_then(Value::as_array_mut) else {
            info!(index, "document has no task list; not rescheduling");
            return Ok(());
        };
        let Some(slot) = locate_task(tasks, index, fired) else {
            info!(index, "completed task no longer in document; not rescheduling");
            return Ok(());
        };
        let Some(object) = tasks[slot].as_object_mut() else {
            return Ok(());
        };
        let current = serde_json::from_value::<Task>(Value::Object(object.clone()));
        if !current.is_ok_and(|task| task.wants_reschedule()) {
            return Ok(());
        }
        let Some(next) = reopen_task(object, now, self.settings.reschedule_offset) else {
            warn!(index = slot, "reschedule offset out of range; task left as is");
            return Ok(());
        };
        info!(index = slot, next = %format_timestamp(next), "completed task rescheduled");
        self.store.write_value(document)
    }

    fn deliver(&self, id: &str, reminder: Reminder) {
        debug!(id, title = %log_snippet(&reminder.title), "delivering reminder");
        if let Err(err) = self.sink.deliver(reminder) {
            warn!(id, %err, "reminder delivery failed");
        }
    }

    fn prune_delivered(&mut self, now: DateTime<Utc>) {
        let Some(horizon) = now.checked_sub_signed(self.settings.grace_window) else {
            return;
        };
        self.delivered.retain(|_, at| *at >= horizon);
    }

    /// Rebuild and report an unreadable document through the sink. A missing
    /// document is an empty schedule, not an error. Returns whether the
    /// document was read.
    fn rebuild_reporting(&mut self, origin: &str) -> (RebuildSummary, bool) {
        let (summary, fallback) = self.rebuild_checked();
        match fallback {
            None => (summary, true),
            Some(StoreError::NotFound(_)) => (summary, false),
            Some(err) => {
                warn!(origin, %err, "reminder document unusable; kept last good schedule");
                self.deliver(
                    origin,
                    Reminder::new("Schedule error", &err.to_string(), DEFAULT_ROUTE),
                );
                (summary, false)
            }
        }
    }

    /// Debounced reload after a change signal.
    fn reload(&mut self) {
        let (summary, read) = self.rebuild_reporting("reload");
        if read && self.settings.notify_on_reload {
            let name = self
                .store
                .path()
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "reminders".to_string());
            self.deliver(
                "reload",
                Reminder::new("Schedules updated", &format!("Reloaded {name}"), DEFAULT_ROUTE),
            );
        }
        debug!(armed = summary.armed, "reload complete");
    }

    fn publish_state(&self, now: DateTime<Utc>, summary: &RebuildSummary) {
        let count = |value: usize| u32::try_from(value).unwrap_or(u32::MAX);
        self.state.send_replace(ScheduleState {
            armed_timers: count(summary.armed),
            entries: count(summary.entries),
            tasks: count(summary.tasks),
            rebuilds: self.rebuilds,
            last_rebuild: format_timestamp(now),
        });
    }

    /// Time to sleep before the next timer link is due.
    fn next_wake(&mut self) -> Option<StdDuration> {
        let deadline = self.registry.next_deadline()?;
        let wait = (deadline - self.clock.now()).min(max_timer_delay());
        Some(wait.to_std().unwrap_or(StdDuration::ZERO))
    }

    fn handle_command(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::Read { reply } => {
                let _ = reply.send(self.store.read_raw());
            }
            SchedulerCommand::Write { payload, reply } => {
                let result = self.store.write_value(payload);
                if let Err(err) = &result {
                    warn!(%err, "rejected reminder document write");
                }
                let _ = reply.send(result);
            }
            SchedulerCommand::Rebuild { reply } => {
                self.rebuild_reporting("rebuild");
                let _ = reply.send(self.state.borrow().clone());
            }
            SchedulerCommand::Deliver { reminder } => self.deliver("request", reminder),
            SchedulerCommand::Shutdown => {}
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SchedulerCommand>,
        mut changes: mpsc::UnboundedReceiver<ChangeSignal>,
    ) {
        self.rebuild_reporting("startup");
        let mut reload_at: Option<Instant> = None;
        loop {
            let wake = self.next_wake();
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        None | Some(SchedulerCommand::Shutdown) => break,
                        Some(command) => self.handle_command(command),
                    }
                }
                Some(signal) = changes.recv() => {
                    debug!(?signal, "change signal received");
                    // Each signal restarts the quiet window.
                    reload_at = Some(Instant::now() + self.settings.reload_debounce);
                }
                _ = sleep_until(reload_at.unwrap_or_else(Instant::now)), if reload_at.is_some() => {
                    reload_at = None;
                    self.reload();
                }
                _ = sleep(wake.unwrap_or_default()), if wake.is_some() => {
                    self.fire_due();
                }
            }
        }
        self.teardown();
    }

    /// Cancel all timers; nothing fires after this returns.
    pub fn teardown(&mut self) {
        let cancelled = self.registry.clear_all();
        info!(cancelled, "scheduler stopped");
    }
}

/// Find the fired task in a freshly read task list.
fn locate_task(tasks: &[Value], index: usize, fired: &Task) -> Option<usize> {
    let field = |task: &Value, key: &str| task.get(key).and_then(Value::as_str).map(str::to_owned);
    if let Some(id) = fired.id.as_deref().filter(|id| !id.is_empty()) {
        return tasks
            .iter()
            .position(|task| field(task, "id").as_deref() == Some(id));
    }
    if let Some(entered) = fired.entered_date.as_deref() {
        return tasks
            .iter()
            .position(|task| field(task, "enteredDate").as_deref() == Some(entered));
    }
    tasks
        .get(index)
        .filter(|task| field(task, "notificationDate") == fired.notification_date)
        .map(|_| index)
}

fn describe_delay(delay: Duration) -> String {
    format_delay(delay.to_std().unwrap_or(StdDuration::ZERO))
}

/// Cloneable front end to the scheduler task.
#[derive(Clone)]
pub struct SchedulerHandle {
    sender: mpsc::UnboundedSender<SchedulerCommand>,
    state: watch::Receiver<ScheduleState>,
}

impl SchedulerHandle {
    pub async fn read(&self) -> Result<Value, SchedulerError> {
        let (reply, response) = oneshot::channel();
        self.send(SchedulerCommand::Read { reply })?;
        response.await.map_err(|_| SchedulerError::Stopped)
    }

    pub async fn write(&self, payload: Value) -> Result<(), SchedulerError> {
        let (reply, response) = oneshot::channel();
        self.send(SchedulerCommand::Write { payload, reply })?;
        Ok(response.await.map_err(|_| SchedulerError::Stopped)??)
    }

    pub async fn rebuild(&self) -> Result<ScheduleState, SchedulerError> {
        let (reply, response) = oneshot::channel();
        self.send(SchedulerCommand::Rebuild { reply })?;
        response.await.map_err(|_| SchedulerError::Stopped)
    }

    pub fn deliver(&self, reminder: Reminder) -> Result<(), SchedulerError> {
        self.send(SchedulerCommand::Deliver { reminder })
    }

    pub fn state(&self) -> ScheduleState {
        self.state.borrow().clone()
    }

    /// Receiver that changes after every rebuild.
    pub fn subscribe(&self) -> watch::Receiver<ScheduleState> {
        self.state.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.sender.send(SchedulerCommand::Shutdown);
    }

    fn send(&self, command: SchedulerCommand) -> Result<(), SchedulerError> {
        self.sender
            .send(command)
            .map_err(|_| SchedulerError::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::testing::RecordingSink;
    use chrono::TimeZone;
    use serde_json::json;
    use std::path::Path;

    /// Wall clock that follows tokio's (pausable) clock from a fixed start.
    struct TestClock {
        base: DateTime<Utc>,
        start: Instant,
    }

    impl TestClock {
        fn at(base: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self {
                base,
                start: Instant::now(),
            })
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> DateTime<Utc> {
            let elapsed = Instant::now().duration_since(self.start);
            self.base + Duration::from_std(elapsed).unwrap_or_else(|_| Duration::zero())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn write_document(path: &Path, document: Value) {
        std::fs::write(path, serde_json::to_string_pretty(&document).unwrap()).unwrap();
    }

    fn read_back(path: &Path) -> Value {
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    fn scheduler_for(
        path: &Path,
        clock: Arc<dyn Clock>,
        sink: Arc<RecordingSink>,
    ) -> Scheduler {
        Scheduler::new(
            DocumentStore::new(path.to_path_buf()),
            sink,
            clock,
            SchedulerSettings::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn interval_rearms_after_each_fire() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        write_document(&path, json!({ "items": [{ "id": "a", "title": "Stretch", "everyMinutes": 1 }] }));
        let sink = Arc::new(RecordingSink::default());
        let clock = TestClock::at(t0());
        let mut scheduler = scheduler_for(&path, clock.clone(), sink.clone());

        scheduler.rebuild();
        assert_eq!(scheduler.registry().target("a"), Some(t0() + Duration::seconds(60)));

        tokio::time::advance(StdDuration::from_secs(60)).await;
        assert_eq!(scheduler.fire_due(), 1);
        assert_eq!(sink.titles(), vec!["Stretch"]);
        assert_eq!(scheduler.registry().target("a"), Some(t0() + Duration::seconds(120)));

        tokio::time::advance(StdDuration::from_secs(60)).await;
        assert_eq!(scheduler.fire_due(), 1);
        assert_eq!(sink.titles().len(), 2);
        assert!(scheduler.registry().contains("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn daily_entry_targets_next_occurrence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        write_document(&path, json!({ "items": [{ "id": "b", "at": "09:00" }] }));
        let sink = Arc::new(RecordingSink::default());
        let clock = TestClock::at(t0());
        let mut scheduler = scheduler_for(&path, clock.clone(), sink.clone());

        scheduler.rebuild();
        let target = scheduler.registry().target("b").expect("armed");
        assert!(target > t0());
        assert!(target - t0() <= Duration::hours(25));

        let wait = (target - clock.now()).to_std().unwrap();
        tokio::time::advance(wait).await;
        assert_eq!(scheduler.fire_due(), 1);
        assert_eq!(sink.titles(), vec!["Reminder"]);
        let next = scheduler.registry().target("b").expect("re-armed");
        assert!(next > target);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        write_document(
            &path,
            json!({ "items": [
                { "everyMinutes": 5 },
                { "id": "bad-at", "at": "9:00" },
                { "id": "zero", "everyMinutes": 0 },
                { "id": "ok", "everyMinutes": 5 }
            ] }),
        );
        let sink = Arc::new(RecordingSink::default());
        let mut scheduler = scheduler_for(&path, TestClock::at(t0()), sink);

        let summary = scheduler.rebuild();
        assert_eq!(summary.armed, 1);
        assert_eq!(summary.skipped, 3);
        assert_eq!(scheduler.registry().ids().collect::<Vec<_>>(), vec!["ok"]);
    }

    #[tokio::test(start_paused = true)]
    async fn task_within_grace_window_fires_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        write_document(
            &path,
            json!({ "tasks": [
                { "name": "Just missed", "notificationDate": "2024-01-01T00:00:30Z" },
                { "name": "Stale", "notificationDate": "2024-01-01T00:00:00Z" },
                { "name": "Done", "notificationDate": "2024-01-01T00:00:50Z", "finished": true },
                { "name": "Removed", "notificationDate": "2024-01-01T00:00:50Z", "remove": true },
                { "name": "Garbage", "notificationDate": "soon" }
            ] }),
        );
        let sink = Arc::new(RecordingSink::default());
        // 30s after "Just missed" and 61s after "Stale".
        let now = t0() + Duration::seconds(61);
        let mut scheduler = scheduler_for(&path, TestClock::at(now), sink.clone());

        let summary = scheduler.rebuild();
        assert_eq!(summary.fire_now, 1);
        assert_eq!(summary.armed, 1);
        assert_eq!(scheduler.fire_due(), 1);
        assert_eq!(sink.titles(), vec!["Just missed"]);
        assert_eq!(scheduler.armed(), 0);

        // A reload inside the window does not repeat it.
        scheduler.rebuild();
        assert_eq!(scheduler.armed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn task_id_falls_back_to_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        write_document(
            &path,
            json!({ "tasks": [
                { "name": "Later", "notificationDate": "2024-01-01T01:00:00Z" },
                { "id": "named", "name": "Named", "notificationDate": "2024-01-01T02:00:00Z" }
            ] }),
        );
        let sink = Arc::new(RecordingSink::default());
        let mut scheduler = scheduler_for(&path, TestClock::at(t0()), sink);

        scheduler.rebuild();
        let ids: Vec<_> = scheduler.registry().ids().collect();
        assert_eq!(ids, vec!["task-0-1704070800000", "named"]);
    }

    #[tokio::test(start_paused = true)]
    async fn rebuild_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        write_document(
            &path,
            json!({
                "items": [{ "id": "a", "everyMinutes": 1 }, { "id": "b", "at": "09:00" }],
                "tasks": [{ "name": "T", "notificationDate": "2024-01-02T00:00:00Z" }]
            }),
        );
        let sink = Arc::new(RecordingSink::default());
        let mut scheduler = scheduler_for(&path, TestClock::at(t0()), sink);

        let first = scheduler.rebuild();
        let second = scheduler.rebuild();
        assert_eq!(first, second);
        assert_eq!(scheduler.armed(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rebuild_cancels_timers_from_previous_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        write_document(&path, json!({ "items": [{ "id": "old", "everyMinutes": 1 }] }));
        let sink = Arc::new(RecordingSink::default());
        let mut scheduler = scheduler_for(&path, TestClock::at(t0()), sink.clone());
        scheduler.rebuild();

        write_document(&path, json!({ "items": [{ "id": "new", "everyMinutes": 2 }] }));
        scheduler.rebuild();
        tokio::time::advance(StdDuration::from_secs(60)).await;
        assert_eq!(scheduler.fire_due(), 0);
        assert!(sink.titles().is_empty());
        assert_eq!(scheduler.registry().ids().collect::<Vec<_>>(), vec!["new"]);
    }

    #[tokio::test(start_paused = true)]
    async fn long_delay_fires_near_true_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        let target = t0() + Duration::days(40);
        write_document(
            &path,
            json!({ "tasks": [{ "id": "far", "name": "Far", "notificationDate": format_timestamp(target) }] }),
        );
        let sink = Arc::new(RecordingSink::default());
        let clock = TestClock::at(t0());
        let mut scheduler = scheduler_for(&path, clock.clone(), sink.clone());
        scheduler.rebuild();

        let mut wakes = 0;
        while let Some(wait) = scheduler.next_wake() {
            tokio::time::advance(wait).await;
            wakes += 1;
            scheduler.fire_due();
        }
        assert!(wakes >= 2);
        assert_eq!(sink.titles(), vec!["Far"]);
        assert!((clock.now() - target).num_seconds().abs() <= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn completed_task_is_rescheduled_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        write_document(
            &path,
            json!({ "tasks": [{
                "name": "Water plants",
                "notificationDate": "2024-01-01T00:00:10Z",
                "deadline": "2024-01-03T00:00:00.000Z",
                "finished": true,
                "reschedule_after_completed": true,
                "enteredDate": "2023-12-01T00:00:00.000Z"
            }] }),
        );
        let sink = Arc::new(RecordingSink::default());
        let clock = TestClock::at(t0());
        let (sender, mut changes) = mpsc::unbounded_channel();
        let mut scheduler = Scheduler::new(
            DocumentStore::new(path.clone()).with_change_signal(sender),
            sink.clone(),
            clock.clone(),
            SchedulerSettings::default(),
        );

        scheduler.rebuild();
        tokio::time::advance(StdDuration::from_secs(10)).await;
        assert_eq!(scheduler.fire_due(), 1);
        assert_eq!(sink.titles(), vec!["Water plants"]);
        assert_eq!(changes.try_recv().ok(), Some(ChangeSignal::StoreWrite));
        // The fired timer does not re-arm itself.
        assert_eq!(scheduler.armed(), 0);

        let document = read_back(&path);
        let task: Task = serde_json::from_value(document["tasks"][0].clone()).unwrap();
        assert!(!task.finished);
        assert!(!task.remove);
        let next = task.fire_time().expect("rescheduled time");
        assert_eq!(next, t0() + Duration::seconds(10) + Duration::hours(24));
        assert_eq!(task.deadline.as_deref(), task.notification_date.as_deref());
        assert_eq!(
            task.entered_date.as_deref(),
            Some(format_timestamp(t0() + Duration::seconds(10)).as_str())
        );

        // The next rebuild arms the rewritten reminder.
        scheduler.rebuild();
        assert_eq!(scheduler.armed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_failure_does_not_stop_recurrence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        write_document(&path, json!({ "items": [{ "id": "a", "everyMinutes": 1 }] }));
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..RecordingSink::default()
        });
        let mut scheduler = scheduler_for(&path, TestClock::at(t0()), sink.clone());
        scheduler.rebuild();

        tokio::time::advance(StdDuration::from_secs(60)).await;
        assert_eq!(scheduler.fire_due(), 1);
        assert_eq!(sink.titles().len(), 1);
        assert!(scheduler.registry().contains("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn loop_coalesces_change_signals_into_one_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        write_document(&path, json!({ "items": [] }));
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler_for(&path, TestClock::at(t0()), sink.clone());
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        let (handle, task) = scheduler.start(change_rx);

        let initial = handle.rebuild().await.expect("rebuild");
        assert_eq!(initial.rebuilds, 2);

        for _ in 0..5 {
            change_tx.send(ChangeSignal::FileChanged).unwrap();
            tokio::time::sleep(StdDuration::from_millis(50)).await;
        }
        tokio::time::sleep(StdDuration::from_millis(400)).await;

        assert_eq!(handle.state().rebuilds, 3);
        assert_eq!(sink.titles(), vec!["Schedules updated"]);

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn loop_reports_unreadable_document_and_keeps_timers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        write_document(&path, json!({ "items": [{ "id": "a", "everyMinutes": 10 }] }));
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler_for(&path, TestClock::at(t0()), sink.clone());
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        let (handle, task) = scheduler.start(change_rx);
        assert_eq!(handle.rebuild().await.unwrap().armed_timers, 1);

        std::fs::write(&path, "{ broken").unwrap();
        change_tx.send(ChangeSignal::FileChanged).unwrap();
        tokio::time::sleep(StdDuration::from_secs(1)).await;

        assert_eq!(sink.titles(), vec!["Schedule error"]);
        assert_eq!(handle.state().armed_timers, 1);

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn loop_fires_timers_and_serves_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        let sink = Arc::new(RecordingSink::default());
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(
            DocumentStore::new(path.clone()).with_change_signal(change_tx),
            sink.clone(),
            TestClock::at(t0()),
            SchedulerSettings {
                notify_on_reload: false,
                ..SchedulerSettings::default()
            },
        );
        let (handle, task) = scheduler.start(change_rx);

        let invalid = handle.write(json!("nope")).await;
        assert!(matches!(
            invalid,
            Err(SchedulerError::Store(StoreError::InvalidPayload(_)))
        ));

        handle
            .write(json!({ "items": [{ "id": "a", "title": "Tick", "everyMinutes": 1 }] }))
            .await
            .expect("write");
        let document = handle.read().await.expect("read");
        assert_eq!(document["items"].as_array().map(Vec::len), Some(1));

        // Write signal -> debounced rebuild -> two ticks.
        tokio::time::sleep(StdDuration::from_secs(121)).await;
        assert_eq!(sink.titles(), vec!["Tick", "Tick"]);
        assert_eq!(handle.state().armed_timers, 1);

        handle
            .deliver(Reminder::new("Test", "Click to open app", "/"))
            .expect("deliver");
        tokio::time::sleep(StdDuration::from_millis(1)).await;
        assert_eq!(sink.titles().last().map(String::as_str), Some("Test"));

        handle.shutdown();
        task.await.unwrap();
        assert!(matches!(handle.read().await, Err(SchedulerError::Stopped)));
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_edits_only_the_fired_task() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        let odd_entry = json!({ "id": "water", "everyMinutes": "5", "note": [1, 2] });
        let odd_task = json!({ "id": 7, "name": "Numeric id", "finished": null });
        let other_task = json!({
            "id": "later",
            "name": "Later",
            "notificationDate": "2024-01-05T00:00:00Z",
            "color": "#ff0000"
        });
        write_document(
            &path,
            json!({
                "items": [odd_entry.clone()],
                "tasks": [
                    odd_task.clone(),
                    {
                        "id": "plants",
                        "name": "Water plants",
                        "notificationDate": "2024-01-01T00:00:10Z",
                        "finished": true,
                        "reschedule_after_completed": true,
                        "tags": ["home"]
                    },
                    other_task.clone()
                ],
                "theme": "dark"
            }),
        );
        let sink = Arc::new(RecordingSink::default());
        let mut scheduler = scheduler_for(&path, TestClock::at(t0()), sink.clone());

        let summary = scheduler.rebuild();
        assert_eq!(summary.skipped, 2);
        tokio::time::advance(StdDuration::from_secs(10)).await;
        assert_eq!(scheduler.fire_due(), 1);
        assert_eq!(sink.titles(), vec!["Water plants"]);

        let document = read_back(&path);
        assert_eq!(document["items"], json!([odd_entry]));
        assert_eq!(document["tasks"][0], odd_task);
        assert_eq!(document["tasks"][2], other_task);
        assert_eq!(document["theme"], json!("dark"));
        let reopened = &document["tasks"][1];
        assert_eq!(reopened["finished"], json!(false));
        assert_eq!(reopened["tags"], json!(["home"]));
        assert_eq!(reopened["id"], json!("plants"));
    }

    #[tokio::test(start_paused = true)]
    async fn out_of_range_offset_leaves_task_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        write_document(
            &path,
            json!({ "tasks": [{
                "name": "Water plants",
                "notificationDate": "2024-01-01T00:00:10Z",
                "finished": true,
                "reschedule_after_completed": true
            }] }),
        );
        let before = read_back(&path);
        let sink = Arc::new(RecordingSink::default());
        let mut scheduler = Scheduler::new(
            DocumentStore::new(path.clone()),
            sink.clone(),
            TestClock::at(t0()),
            SchedulerSettings {
                grace_window: Duration::MAX,
                reschedule_offset: Duration::MAX,
                ..SchedulerSettings::default()
            },
        );

        scheduler.rebuild();
        tokio::time::advance(StdDuration::from_secs(10)).await;
        assert_eq!(scheduler.fire_due(), 1);
        assert_eq!(sink.titles(), vec!["Water plants"]);
        assert_eq!(read_back(&path), before);
    }

    #[tokio::test(start_paused = true)]
    async fn startup_reports_unreadable_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(&path, "{ broken").unwrap();
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler_for(&path, TestClock::at(t0()), sink.clone());
        let (_change_tx, change_rx) = mpsc::unbounded_channel();
        let (handle, task) = scheduler.start(change_rx);

        tokio::time::sleep(StdDuration::from_millis(1)).await;
        assert_eq!(sink.titles(), vec!["Schedule error"]);
        assert_eq!(handle.state().armed_timers, 0);

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn missing_document_is_not_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler_for(&path, TestClock::at(t0()), sink.clone());
        let (_change_tx, change_rx) = mpsc::unbounded_channel();
        let (handle, task) = scheduler.start(change_rx);

        assert_eq!(handle.rebuild().await.unwrap().rebuilds, 2);
        assert!(sink.titles().is_empty());

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn requested_rebuild_reports_unreadable_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        write_document(&path, json!({ "items": [{ "id": "a", "everyMinutes": 10 }] }));
        let sink = Arc::new(RecordingSink::default());
        let scheduler = scheduler_for(&path, TestClock::at(t0()), sink.clone());
        let (_change_tx, change_rx) = mpsc::unbounded_channel();
        let (handle, task) = scheduler.start(change_rx);

        std::fs::write(&path, "[1, 2").unwrap();
        let state = handle.rebuild().await.unwrap();
        assert_eq!(state.armed_timers, 1);
        assert_eq!(sink.titles(), vec!["Schedule error"]);

        handle.shutdown();
        task.await.unwrap();
    }
}
