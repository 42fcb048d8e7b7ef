//! Shared types and configuration for Taskminder.

pub mod config;
pub mod control;
pub mod model;
pub mod recurrence;
pub mod util;

pub use config::*;
pub use control::*;
pub use model::*;
pub use recurrence::*;
pub use util::program_in_path;
