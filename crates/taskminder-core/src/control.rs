//! D-Bus control interface types and proxy definitions.

use serde::{Deserialize, Serialize};
use zbus::proxy;
use zbus::zvariant::Type;

/// Well-known bus name for the Taskminder control interface.
pub const CONTROL_BUS_NAME: &str = "dev.taskminder.Control";
/// Object path for control methods and signals.
pub const CONTROL_OBJECT_PATH: &str = "/dev/taskminder/Control";

/// Scheduler snapshot broadcast after every rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Type)]
pub struct ScheduleState {
    pub armed_timers: u32,
    pub entries: u32,
    pub tasks: u32,
    pub rebuilds: u64,
    /// RFC 3339 time of the last rebuild, empty before the first one.
    pub last_rebuild: String,
}

#[proxy(
    interface = "dev.taskminder.Control",
    default_service = "dev.taskminder.Control",
    default_path = "/dev/taskminder/Control"
)]
trait Control {
    /// Current reminder document as JSON.
    fn read_tasks(&self) -> zbus::Result<String>;

    /// Replace the reminder document with a JSON object.
    fn write_tasks(&self, payload: &str) -> zbus::Result<()>;

    /// Tear down all timers and re-derive them from the document.
    fn rebuild(&self) -> zbus::Result<ScheduleState>;

    /// Current scheduler state.
    fn get_state(&self) -> zbus::Result<ScheduleState>;

    /// Deliver a test reminder through the notification sink.
    fn test_notification(&self) -> zbus::Result<()>;

    #[zbus(signal)]
    fn schedules_rebuilt(&self, state: ScheduleState) -> zbus::Result<()>;
}
