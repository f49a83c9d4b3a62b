//! Task lifecycle orchestration at creation time.
//!
//! For every new task two jobs are enqueued: `warn` at
//! `due - warn_window` and `overdue` at `due`, both floored at "now". The
//! owner gets an immediate "assigned" notice. None of this can fail task
//! creation: once the task row exists the caller gets it back.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use duetask_core::{Clock, NewTask, Task};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::dispatch::Notifier;
use crate::error::StoreResult;
use crate::jobs::{JobKind, JobPayload, Scheduler};
use crate::notify::{ASSIGNED_PREFIX, build_message};
use crate::store::TaskStore;

/// Fire delays for the two jobs of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobDelays {
    pub warn: Duration,
    pub overdue: Duration,
}

/// `overdue = max(0, due - now)`, `warn = max(0, overdue - warn_window)`.
pub fn compute_delays(due: DateTime<Utc>, now: DateTime<Utc>, warn_window: Duration) -> JobDelays {
    let overdue = (due - now).max(Duration::zero());
    let warn = (overdue - warn_window).max(Duration::zero());
    JobDelays { warn, overdue }
}

/// What got scheduled for a task. A `None` job ID means that enqueue failed
/// (and was logged).
#[derive(Debug)]
pub struct ScheduleReport {
    pub delays: JobDelays,
    pub warn_job: Option<String>,
    pub overdue_job: Option<String>,
    /// The in-flight "assigned" notice; resolves to whether it was accepted.
    pub assigned_notice: JoinHandle<bool>,
}

pub struct TaskLifecycleOrchestrator {
    store: Arc<dyn TaskStore>,
    scheduler: Arc<dyn Scheduler>,
    notifier: Arc<Notifier>,
    clock: Arc<dyn Clock>,
    warn_window: Duration,
}

impl TaskLifecycleOrchestrator {
    pub fn new(
        store: Arc<dyn TaskStore>,
        scheduler: Arc<dyn Scheduler>,
        notifier: Arc<Notifier>,
        clock: Arc<dyn Clock>,
        warn_window: Duration,
    ) -> Self {
        Self {
            store,
            scheduler,
            notifier,
            clock,
            warn_window,
        }
    }

    /// Persist a new task for `owner_id`, then schedule its lifecycle.
    /// Only the insert itself can fail.
    pub async fn create_task(
        &self,
        input: NewTask,
        owner_id: &str,
    ) -> StoreResult<(Task, ScheduleReport)> {
        let task = Task::new(input, owner_id, self.clock.now());
        let task = self.store.create(task).await?;
        info!(task_id = %task.id, owner_id, due_date = %task.due_date, "Task created");
        let report = self.on_task_created(&task, owner_id).await;
        Ok((task, report))
    }

    /// Enqueue the `warn` and `overdue` jobs and send the assigned notice.
    /// Called once per task, after it is persisted.
    pub async fn on_task_created(&self, task: &Task, owner_id: &str) -> ScheduleReport {
        let delays = compute_delays(task.due_date, self.clock.now(), self.warn_window);
        let payload = JobPayload {
            user_id: owner_id.to_string(),
            task_id: task.id.clone(),
            due_date: task.due_date,
        };

        let warn_job = self.enqueue(JobKind::Warn, &payload, delays.warn).await;
        let overdue_job = self.enqueue(JobKind::Overdue, &payload, delays.overdue).await;

        let assigned_notice = self
            .notifier
            .dispatch_detached(owner_id, build_message(task, ASSIGNED_PREFIX));

        ScheduleReport {
            delays,
            warn_job,
            overdue_job,
            assigned_notice,
        }
    }

    async fn enqueue(&self, kind: JobKind, payload: &JobPayload, delay: Duration) -> Option<String> {
        match self.scheduler.enqueue(kind, payload, delay).await {
            Ok(id) => {
                info!(
                    job_id = %id,
                    %kind,
                    task_id = %payload.task_id,
                    delay_secs = delay.num_seconds(),
                    "Job scheduled"
                );
                Some(id)
            }
            Err(e) => {
                error!(%kind, task_id = %payload.task_id, error = %e, "Failed to schedule job");
                None
            }
        }
    }
}
