//! Notification delivery for fired reminders.
//!
//! Sinks never block the scheduler: the desktop sink hands reminders to a
//! delivery task and reports only a closed queue back to the caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use taskminder_core::util::log_snippet;
use taskminder_core::{route_url, NotificationConfig, Reminder};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use zbus::zvariant::Value;
use zbus::{proxy, Connection};

use crate::opener::open_url;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("notification delivery queue is closed")]
    Closed,
    #[error("notification bus error: {0}")]
    Bus(#[from] zbus::Error),
}

/// Receives reminders from the scheduler.
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, reminder: Reminder) -> Result<(), SinkError>;
}

#[proxy(
    interface = "org.freedesktop.Notifications",
    default_service = "org.freedesktop.Notifications",
    default_path = "/org/freedesktop/Notifications"
)]
trait Notifications {
    #[allow(clippy::too_many_arguments)]
    fn notify(
        &self,
        app_name: &str,
        replaces_id: u32,
        app_icon: &str,
        summary: &str,
        body: &str,
        actions: &[&str],
        hints: HashMap<&str, Value<'_>>,
        expire_timeout: i32,
    ) -> zbus::Result<u32>;

    #[zbus(signal)]
    fn action_invoked(&self, id: u32, action_key: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    fn notification_closed(&self, id: u32, reason: u32) -> zbus::Result<()>;
}

/// Resolves the click-through base URL at click time.
pub type AppUrlSource = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Logs reminders instead of showing them; used for headless runs.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn deliver(&self, reminder: Reminder) -> Result<(), SinkError> {
        info!(
            title = %log_snippet(&reminder.title),
            message = %log_snippet(&reminder.message),
            route = %reminder.route,
            "reminder"
        );
        Ok(())
    }
}

/// Shows reminders through org.freedesktop.Notifications on the session bus.
pub struct DesktopSink {
    sender: mpsc::UnboundedSender<Reminder>,
}

impl DesktopSink {
    /// Spawn the delivery and click-through tasks on the current runtime.
    pub fn start(connection: Connection, settings: NotificationConfig, app_url: AppUrlSource) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let routes: Arc<Mutex<HashMap<u32, String>>> = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(run_delivery(
            connection.clone(),
            settings.clone(),
            routes.clone(),
            receiver,
        ));
        tokio::spawn(run_click_through(connection, settings, routes, app_url));
        Self { sender }
    }
}

impl NotificationSink for DesktopSink {
    fn deliver(&self, reminder: Reminder) -> Result<(), SinkError> {
        self.sender.send(reminder).map_err(|_| SinkError::Closed)
    }
}

async fn run_delivery(
    connection: Connection,
    settings: NotificationConfig,
    routes: Arc<Mutex<HashMap<u32, String>>>,
    mut receiver: mpsc::UnboundedReceiver<Reminder>,
) {
    let proxy = match NotificationsProxy::new(&connection).await {
        Ok(proxy) => proxy,
        Err(err) => {
            warn!(?err, "notification service unavailable; reminders will be dropped");
            while let Some(reminder) = receiver.recv().await {
                warn!(title = %log_snippet(&reminder.title), "dropping reminder");
            }
            return;
        }
    };
    while let Some(reminder) = receiver.recv().await {
        match show(&proxy, &settings, &reminder).await {
            Ok(id) => {
                debug!(id, title = %log_snippet(&reminder.title), "reminder shown");
                if let Ok(mut routes) = routes.lock() {
                    routes.insert(id, reminder.route);
                }
            }
            Err(err) => {
                // No retry: the reminder counts as fired either way.
                warn!(%err, title = %log_snippet(&reminder.title), "reminder delivery failed");
            }
        }
    }
}

async fn show(
    proxy: &NotificationsProxy<'_>,
    settings: &NotificationConfig,
    reminder: &Reminder,
) -> Result<u32, SinkError> {
    let mut hints = HashMap::new();
    hints.insert("category", Value::from("x-taskminder.reminder"));
    hints.insert("desktop-entry", Value::from("taskminder"));
    let id = proxy
        .notify(
            &settings.app_name,
            0,
            &settings.app_icon,
            &reminder.title,
            &reminder.message,
            &["default", "Open"],
            hints,
            settings.expire_timeout_ms,
        )
        .await?;
    Ok(id)
}

async fn run_click_through(
    connection: Connection,
    settings: NotificationConfig,
    routes: Arc<Mutex<HashMap<u32, String>>>,
    app_url: AppUrlSource,
) {
    let proxy = match NotificationsProxy::new(&connection).await {
        Ok(proxy) => proxy,
        Err(err) => {
            warn!(?err, "click-through unavailable");
            return;
        }
    };
    let (mut invoked, mut closed) = match (
        proxy.receive_action_invoked().await,
        proxy.receive_notification_closed().await,
    ) {
        (Ok(invoked), Ok(closed)) => (invoked, closed),
        (Err(err), _) | (_, Err(err)) => {
            warn!(?err, "failed to subscribe to notification signals");
            return;
        }
    };

    loop {
        tokio::select! {
            signal = invoked.next() => {
                let Some(signal) = signal else {
                    break;
                };
                let Ok(args) = signal.args() else {
                    continue;
                };
                let route = routes.lock().ok().and_then(|routes| routes.get(args.id()).cloned());
                // Signals for notifications from other applications are ignored.
                let Some(route) = route else {
                    continue;
                };
                let Some(base) = app_url() else {
                    info!(route = %route, "no app URL configured for click-through");
                    continue;
                };
                open_url(&settings.open_command, &route_url(&base, &route));
            }
            signal = closed.next() => {
                let Some(signal) = signal else {
                    break;
                };
                if let Ok(args) = signal.args() {
                    if let Ok(mut routes) = routes.lock() {
                        routes.remove(args.id());
                    }
                }
            }
        }
    }
    debug!("notification signal streams ended");
}
