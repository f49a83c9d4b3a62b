//! # Duetask Core
//!
//! Shared building blocks for the duetask workspace:
//! - [`config`] — TOML configuration with serde defaults
//! - [`clock`] — injectable time source
//! - [`task`] — the task model and its status enum
//! - [`error`] — crate-wide error type

pub mod clock;
pub mod config;
pub mod error;
pub mod task;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::DuetaskConfig;
pub use error::{DuetaskError, Result};
pub use task::{NewTask, Task, TaskStatus, TaskUpdate};
