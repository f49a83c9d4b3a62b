//! Status transition worker — the handler behind the `warn` and `overdue` jobs.
//!
//! Both handlers are safe to run any number of times for the same job. The
//! overdue transition is a conditional update keyed on the task still being
//! open, so a replay (or a user who finished the task first) affects zero
//! rows and sends nothing.

use std::sync::Arc;

use async_trait::async_trait;
use duetask_core::{Clock, TaskStatus};
use tracing::{debug, info, warn};

use crate::dispatch::Notifier;
use crate::error::JobError;
use crate::jobs::{JobHandler, JobKind, JobOutcome, JobPayload, SkipReason};
use crate::notify::{DUE_SOON_PREFIX, OVERDUE_PREFIX, build_message};
use crate::store::TaskStore;

/// Stateless handler over injected collaborators; one instance serves every job.
pub struct StatusTransitionWorker {
    store: Arc<dyn TaskStore>,
    notifier: Arc<Notifier>,
    clock: Arc<dyn Clock>,
}

impl StatusTransitionWorker {
    pub fn new(store: Arc<dyn TaskStore>, notifier: Arc<Notifier>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            notifier,
            clock,
        }
    }

    /// Send the "due soon" notice if the task is still open. Never mutates.
    pub async fn handle_warn(&self, payload: &JobPayload) -> Result<JobOutcome, JobError> {
        let Some(task) = self.store.find_by_id(&payload.task_id).await? else {
            debug!(task_id = %payload.task_id, "Warn skipped: task no longer exists");
            return Ok(JobOutcome::Skipped(SkipReason::TaskMissing));
        };

        if !task.status.is_open() {
            debug!(task_id = %task.id, status = %task.status, "Warn skipped: task not open");
            return Ok(JobOutcome::Skipped(SkipReason::NotOpen(task.status)));
        }

        let body = build_message(&task, DUE_SOON_PREFIX);
        self.notifier.dispatch(&payload.user_id, body).await;
        info!(task_id = %task.id, user_id = %payload.user_id, "Due-soon warning sent");
        Ok(JobOutcome::Completed)
    }

    /// Move an open task to `OVERDUE` and notify its owner.
    pub async fn handle_overdue(&self, payload: &JobPayload) -> Result<JobOutcome, JobError> {
        let now = self.clock.now();
        if now < payload.due_date {
            debug!(
                task_id = %payload.task_id,
                due_date = %payload.due_date,
                "Overdue job delivered early, deferring to due date"
            );
            return Ok(JobOutcome::Deferred(payload.due_date));
        }

        let affected = self
            .store
            .conditional_update_status(&payload.task_id, &TaskStatus::OPEN, TaskStatus::Overdue)
            .await?;
        if affected == 0 {
            debug!(task_id = %payload.task_id, "Overdue skipped: task missing or no longer open");
            return Ok(JobOutcome::Skipped(SkipReason::StaleState));
        }
        info!(task_id = %payload.task_id, "Task marked overdue");

        // The transition has happened; a replay would find zero rows, so a
        // failed snapshot read is logged rather than retried.
        match self.store.find_by_id(&payload.task_id).await {
            Ok(Some(task)) => {
                let body = build_message(&task, OVERDUE_PREFIX);
                self.notifier.dispatch(&payload.user_id, body).await;
            }
            Ok(None) => {
                debug!(task_id = %payload.task_id, "Task deleted right after overdue transition");
            }
            Err(e) => {
                warn!(
                    task_id = %payload.task_id,
                    error = %e,
                    "Overdue notice not sent: snapshot read failed"
                );
            }
        }
        Ok(JobOutcome::Completed)
    }
}

#[async_trait]
impl JobHandler for StatusTransitionWorker {
    async fn handle(&self, kind: JobKind, payload: &JobPayload) -> Result<JobOutcome, JobError> {
        match kind {
            JobKind::Warn => self.handle_warn(payload).await,
            JobKind::Overdue => self.handle_overdue(payload).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::RecordingChannel;
    use crate::store::MemoryTaskStore;
    use chrono::{Duration, Utc};
    use duetask_core::{ManualClock, NewTask, Task};

    struct Fixture {
        store: Arc<MemoryTaskStore>,
        channel: Arc<RecordingChannel>,
        clock: Arc<ManualClock>,
        worker: StatusTransitionWorker,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryTaskStore::new().with_clock(clock.clone()));
        let channel = Arc::new(RecordingChannel::new());
        let worker = StatusTransitionWorker::new(
            store.clone(),
            Arc::new(Notifier::new(channel.clone())),
            clock.clone(),
        );
        Fixture {
            store,
            channel,
            clock,
            worker,
        }
    }

    async fn seed(f: &Fixture, status: TaskStatus) -> (Task, JobPayload) {
        let mut task = Task::new(
            NewTask {
                topic: "Write report".into(),
                description: String::new(),
                due_date: f.clock.now() + Duration::minutes(15),
            },
            "user-1",
            f.clock.now(),
        );
        task.status = status;
        let task = f.store.create(task).await.unwrap();
        let payload = JobPayload {
            user_id: task.owner_id.clone(),
            task_id: task.id.clone(),
            due_date: task.due_date,
        };
        (task, payload)
    }

    #[tokio::test]
    async fn test_warn_notifies_open_task_without_mutating() {
        let f = fixture();
        let (task, payload) = seed(&f, TaskStatus::InProgress).await;
        f.clock.advance(Duration::minutes(5));

        let outcome = f.worker.handle_warn(&payload).await.unwrap();
        assert_eq!(outcome, JobOutcome::Completed);

        let sent = f.channel.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient_user_id, "user-1");
        assert!(sent[0].body.starts_with(DUE_SOON_PREFIX));
        let stored = f.store.find_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn test_warn_skips_closed_task() {
        let f = fixture();
        let (_, payload) = seed(&f, TaskStatus::Done).await;
        let outcome = f.worker.handle_warn(&payload).await.unwrap();
        assert_eq!(outcome, JobOutcome::Skipped(SkipReason::NotOpen(TaskStatus::Done)));
        assert!(f.channel.messages().is_empty());
    }

    #[tokio::test]
    async fn test_overdue_not_applied_to_closed_tasks() {
        for status in [TaskStatus::Overdue, TaskStatus::Done] {
            let f = fixture();
            let (task, payload) = seed(&f, status).await;
            f.clock.advance(Duration::minutes(15));

            let outcome = f.worker.handle_overdue(&payload).await.unwrap();
            assert_eq!(outcome, JobOutcome::Skipped(SkipReason::StaleState));
            assert_eq!(f.store.find_by_id(&task.id).await.unwrap().unwrap().status, status);
            assert!(f.channel.messages().is_empty());
        }
    }

    #[tokio::test]
    async fn test_overdue_twice_transitions_once() {
        for status in TaskStatus::OPEN {
            let f = fixture();
            let (task, payload) = seed(&f, status).await;
            f.clock.advance(Duration::minutes(15));

            assert_eq!(f.worker.handle_overdue(&payload).await.unwrap(), JobOutcome::Completed);
            assert_eq!(
                f.worker.handle_overdue(&payload).await.unwrap(),
                JobOutcome::Skipped(SkipReason::StaleState)
            );

            let stored = f.store.find_by_id(&task.id).await.unwrap().unwrap();
            assert_eq!(stored.status, TaskStatus::Overdue, "from {status}");
            assert_eq!(stored.updated_at, f.clock.now());
            let sent = f.channel.messages();
            assert_eq!(sent.len(), 1);
            assert!(sent[0].body.starts_with(OVERDUE_PREFIX));
        }
    }

    #[tokio::test]
    async fn test_deleted_task_is_a_no_op_for_both_handlers() {
        let f = fixture();
        let (task, payload) = seed(&f, TaskStatus::ToDo).await;
        f.store.delete(&task.id).await.unwrap();
        f.clock.advance(Duration::minutes(15));

        assert_eq!(
            f.worker.handle(JobKind::Warn, &payload).await.unwrap(),
            JobOutcome::Skipped(SkipReason::TaskMissing)
        );
        assert_eq!(
            f.worker.handle(JobKind::Overdue, &payload).await.unwrap(),
            JobOutcome::Skipped(SkipReason::StaleState)
        );
        assert!(f.channel.messages().is_empty());
    }

    #[tokio::test]
    async fn test_early_overdue_delivery_defers() {
        let f = fixture();
        let (task, payload) = seed(&f, TaskStatus::ToDo).await;
        f.clock.advance(Duration::minutes(14));

        let outcome = f.worker.handle_overdue(&payload).await.unwrap();
        assert_eq!(outcome, JobOutcome::Deferred(task.due_date));
        assert_eq!(f.store.find_by_id(&task.id).await.unwrap().unwrap().status, TaskStatus::ToDo);
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_as_transient() {
        let f = fixture();
        let (_, payload) = seed(&f, TaskStatus::ToDo).await;
        f.clock.advance(Duration::minutes(15));
        f.store.fail_next(1);

        let err = f.worker.handle_overdue(&payload).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_dispatch_failure_does_not_fail_job() {
        let f = fixture();
        let (task, payload) = seed(&f, TaskStatus::ToDo).await;
        f.clock.advance(Duration::minutes(15));
        f.channel.set_failing(true);

        assert_eq!(f.worker.handle_overdue(&payload).await.unwrap(), JobOutcome::Completed);
        assert_eq!(
            f.store.find_by_id(&task.id).await.unwrap().unwrap().status,
            TaskStatus::Overdue
        );
    }
}
