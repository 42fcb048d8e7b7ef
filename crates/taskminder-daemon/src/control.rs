//! D-Bus control interface for reading, writing and rebuilding schedules.

use serde_json::Value;
use taskminder_core::util::log_snippet;
use taskminder_core::{Reminder, ScheduleState, CONTROL_BUS_NAME, CONTROL_OBJECT_PATH};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use zbus::fdo::{RequestNameFlags, RequestNameReply};
use zbus::{interface, Connection, SignalContext};

use crate::scheduler::{SchedulerError, SchedulerHandle};
use crate::store::StoreError;

pub struct ControlServer {
    scheduler: SchedulerHandle,
}

impl ControlServer {
    pub fn new(scheduler: SchedulerHandle) -> Self {
        Self { scheduler }
    }
}

#[interface(name = "dev.taskminder.Control")]
impl ControlServer {
    async fn read_tasks(&self) -> zbus::fdo::Result<String> {
        let document = self.scheduler.read().await.map_err(to_fdo_error)?;
        serde_json::to_string_pretty(&document)
            .map_err(|err| zbus::fdo::Error::Failed(err.to_string()))
    }

    async fn write_tasks(&self, payload: &str) -> zbus::fdo::Result<()> {
        let value = parse_payload(payload)?;
        self.scheduler.write(value).await.map_err(to_fdo_error)?;
        info!("reminder document replaced over control bus");
        Ok(())
    }

    async fn rebuild(&self) -> zbus::fdo::Result<ScheduleState> {
        self.scheduler.rebuild().await.map_err(to_fdo_error)
    }

    async fn get_state(&self) -> ScheduleState {
        self.scheduler.state()
    }

    async fn test_notification(&self) -> zbus::fdo::Result<()> {
        self.scheduler
            .deliver(Reminder::new(
                "Test Notification",
                "Click to open app",
                taskminder_core::DEFAULT_ROUTE,
            ))
            .map_err(to_fdo_error)
    }

    #[zbus(signal)]
    async fn schedules_rebuilt(ctx: &SignalContext<'_>, state: ScheduleState) -> zbus::Result<()>;
}

/// Emit `SchedulesRebuilt` for every state published by the scheduler.
pub async fn forward_rebuilds(connection: Connection, mut updates: watch::Receiver<ScheduleState>) {
    let ctx = match SignalContext::new(&connection, CONTROL_OBJECT_PATH) {
        Ok(ctx) => ctx,
        Err(err) => {
            warn!(?err, "cannot emit rebuild signals");
            return;
        }
    };
    while updates.changed().await.is_ok() {
        let state = updates.borrow_and_update().clone();
        debug!(armed = state.armed_timers, rebuilds = state.rebuilds, "emitting rebuild signal");
        if let Err(err) = ControlServer::schedules_rebuilt(&ctx, state).await {
            warn!(?err, "failed to emit rebuild signal");
        }
    }
}

pub async fn request_control_name(connection: &Connection) -> zbus::Result<RequestNameReply> {
    let flags = RequestNameFlags::DoNotQueue;
    connection
        .request_name_with_flags(CONTROL_BUS_NAME, flags.into())
        .await
}

fn parse_payload(payload: &str) -> zbus::fdo::Result<Value> {
    serde_json::from_str(payload).map_err(|err| {
        warn!(payload = %log_snippet(payload), %err, "rejected malformed document payload");
        zbus::fdo::Error::InvalidArgs(format!("payload is not valid JSON: {err}"))
    })
}

fn to_fdo_error(err: SchedulerError) -> zbus::fdo::Error {
    match err {
        SchedulerError::Store(StoreError::InvalidPayload(reason)) => {
            zbus::fdo::Error::InvalidArgs(reason)
        }
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}
