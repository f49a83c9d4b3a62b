//! # Duetask Scheduler
//!
//! Due-date driven task lifecycle: delayed jobs, overdue transitions and
//! push notifications.
//!
//! ## Design Principles
//! - SQLite persistence: tasks and pending jobs survive restarts
//! - At-least-once delivery, so every handler is idempotent
//! - Status changes are conditional updates, never read-then-write
//! - Notifications are best-effort and never fail a job
//!
//! ## Architecture
//! ```text
//! TaskLifecycleOrchestrator (on create)
//!   ├── warn job     → fire at due - warn_window
//!   ├── overdue job  → fire at due
//!   └── "New task assigned" → Notifier
//!
//! SchedulerEngine (tokio interval)
//!   ├── recover expired leases
//!   ├── claim due jobs → StatusTransitionWorker
//!   │     ├── warn:    task open?  → "Task due soon"
//!   │     └── overdue: TO_DO|IN_PROGRESS → OVERDUE → "Task overdue"
//!   └── complete / defer / retry (backoff) / dead-letter
//!
//! Notifier → PushChannel
//!   ├── OneSignal (HTTP POST)
//!   └── Recording (in-memory)
//! ```

pub mod dispatch;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod lifecycle;
pub mod notify;
pub mod persistence;
pub mod store;
pub mod worker;

pub use dispatch::{Notifier, OneSignalChannel, PushChannel, RecordingChannel};
pub use engine::{SchedulerEngine, TickReport};
pub use error::{ChannelError, JobError, StoreError, StoreResult};
pub use jobs::{
    DeliveryState, JobCounts, JobHandler, JobKind, JobOutcome, JobPayload, JobQueue, RetryPolicy,
    ScheduledJob, Scheduler, SkipReason,
};
pub use lifecycle::{JobDelays, ScheduleReport, TaskLifecycleOrchestrator, compute_delays};
pub use notify::{NotificationMessage, build_message};
pub use persistence::SchedulerDb;
pub use store::{MemoryTaskStore, TaskStore};
pub use worker::StatusTransitionWorker;
