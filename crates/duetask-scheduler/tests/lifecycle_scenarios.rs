//! End-to-end lifecycle scenarios: orchestrator, SQLite queue, engine and
//! worker wired together over a manual clock.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use duetask_core::config::SchedulerConfig;
use duetask_core::{Clock, ManualClock, NewTask, Task, TaskStatus};
use duetask_scheduler::notify::{ASSIGNED_PREFIX, DUE_SOON_PREFIX, OVERDUE_PREFIX};
use duetask_scheduler::{
    DeliveryState, JobKind, JobPayload, JobQueue, Notifier, RecordingChannel, SchedulerDb,
    SchedulerEngine, StatusTransitionWorker, TaskLifecycleOrchestrator, TaskStore,
};

struct Harness {
    clock: Arc<ManualClock>,
    db: Arc<SchedulerDb>,
    channel: Arc<RecordingChannel>,
    orchestrator: TaskLifecycleOrchestrator,
    worker: Arc<StatusTransitionWorker>,
    engine: SchedulerEngine,
}

fn harness() -> Harness {
    let start = DateTime::parse_from_rfc3339("2026-10-14T10:00:00Z")
        .unwrap()
        .with_timezone(&Utc);
    let clock = Arc::new(ManualClock::new(start));
    let db = Arc::new(SchedulerDb::open_in_memory().unwrap().with_clock(clock.clone()));
    let channel = Arc::new(RecordingChannel::new());
    let notifier = Arc::new(Notifier::new(channel.clone()));
    let config = SchedulerConfig::default();

    let orchestrator = TaskLifecycleOrchestrator::new(
        db.clone(),
        db.clone(),
        notifier.clone(),
        clock.clone(),
        config.warn_window(),
    );
    let worker = Arc::new(StatusTransitionWorker::new(db.clone(), notifier, clock.clone()));
    let mut engine = SchedulerEngine::new(db.clone(), clock.clone(), &config);
    engine.register(JobKind::Warn, worker.clone());
    engine.register(JobKind::Overdue, worker.clone());

    Harness {
        clock,
        db,
        channel,
        orchestrator,
        worker,
        engine,
    }
}

impl Harness {
    async fn create(&self, due_in: Duration) -> Task {
        let (task, report) = self
            .orchestrator
            .create_task(
                NewTask {
                    topic: "Quarterly report".into(),
                    description: "Numbers for Q3".into(),
                    due_date: self.clock.now() + due_in,
                },
                "user-1",
            )
            .await
            .unwrap();
        assert!(report.assigned_notice.await.unwrap());
        task
    }

    async fn status(&self, id: &str) -> TaskStatus {
        self.db.find_by_id(id).await.unwrap().unwrap().status
    }

    fn prefixes(&self) -> Vec<String> {
        self.channel
            .messages()
            .into_iter()
            .map(|m| m.body.lines().next().unwrap_or_default().to_string())
            .collect()
    }
}

#[tokio::test]
async fn test_due_in_fifteen_minutes_schedules_warn_at_five() {
    let h = harness();
    let task = h.create(Duration::minutes(15)).await;

    assert_eq!(task.status, TaskStatus::ToDo);
    let jobs = h.db.jobs_for_task(&task.id).unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].kind, "warn");
    assert_eq!(jobs[0].fire_at - h.clock.now(), Duration::minutes(5));
    assert_eq!(jobs[1].kind, "overdue");
    assert_eq!(jobs[1].fire_at - h.clock.now(), Duration::minutes(15));
    assert_eq!(h.prefixes(), vec![ASSIGNED_PREFIX.to_string()]);
}

#[tokio::test]
async fn test_engine_fires_warn_then_overdue() {
    let h = harness();
    let task = h.create(Duration::minutes(15)).await;

    // Nothing is due yet.
    assert_eq!(h.engine.tick().await.unwrap().claimed, 0);

    h.clock.advance(Duration::minutes(5));
    let report = h.engine.tick().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(h.status(&task.id).await, TaskStatus::ToDo);

    h.clock.advance(Duration::minutes(10));
    let report = h.engine.tick().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(h.status(&task.id).await, TaskStatus::Overdue);

    assert_eq!(
        h.prefixes(),
        vec![
            ASSIGNED_PREFIX.to_string(),
            DUE_SOON_PREFIX.to_string(),
            OVERDUE_PREFIX.to_string(),
        ]
    );
    for job in h.db.jobs_for_task(&task.id).unwrap() {
        assert_eq!(job.state, DeliveryState::Delivered);
    }
}

#[tokio::test]
async fn test_task_finished_before_due_is_left_alone() {
    let h = harness();
    let task = h.create(Duration::minutes(15)).await;

    h.clock.advance(Duration::minutes(14));
    h.db.update_status(&task.id, TaskStatus::Done).await.unwrap();

    h.clock.advance(Duration::minutes(1));
    let report = h.engine.tick().await.unwrap();
    // The warn job was due at +5 and is only now delivered, also as a no-op.
    assert_eq!(report.claimed, 2);
    assert_eq!(report.skipped, 2);

    let stored = h.db.find_by_id(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Done);
    assert_eq!(h.prefixes(), vec![ASSIGNED_PREFIX.to_string()]);
}

#[tokio::test]
async fn test_overdue_run_twice_in_sequence() {
    let h = harness();
    let task = h.create(Duration::minutes(15)).await;
    h.clock.advance(Duration::minutes(15));

    let payload = JobPayload {
        user_id: "user-1".into(),
        task_id: task.id.clone(),
        due_date: task.due_date,
    };
    h.worker.handle_overdue(&payload).await.unwrap();
    h.worker.handle_overdue(&payload).await.unwrap();

    assert_eq!(h.status(&task.id).await, TaskStatus::Overdue);
    let overdue_notices = h
        .prefixes()
        .into_iter()
        .filter(|p| p == OVERDUE_PREFIX)
        .count();
    assert_eq!(overdue_notices, 1);
}

#[tokio::test]
async fn test_redelivery_after_lost_lease_transitions_once() {
    let h = harness();
    let task = h.create(Duration::zero()).await;

    // A runner claims both jobs and dies without acknowledging them.
    let claimed = h.db.claim_due(10, Duration::seconds(60)).await.unwrap();
    assert_eq!(claimed.len(), 2);
    assert_eq!(h.engine.tick().await.unwrap().claimed, 0);

    h.clock.advance(Duration::seconds(61));
    let report = h.engine.tick().await.unwrap();
    assert_eq!(report.recovered, 2);
    assert_eq!(report.claimed, 2);
    assert_eq!(h.status(&task.id).await, TaskStatus::Overdue);

    // Running the overdue job once more changes nothing.
    let payload = JobPayload {
        user_id: "user-1".into(),
        task_id: task.id.clone(),
        due_date: task.due_date,
    };
    h.worker.handle_overdue(&payload).await.unwrap();
    let overdue_notices = h
        .prefixes()
        .into_iter()
        .filter(|p| p == OVERDUE_PREFIX)
        .count();
    assert_eq!(overdue_notices, 1);
}

#[tokio::test]
async fn test_deleted_task_jobs_complete_quietly() {
    let h = harness();
    let task = h.create(Duration::minutes(15)).await;
    assert!(h.db.delete(&task.id).await.unwrap());

    h.clock.advance(Duration::minutes(15));
    let report = h.engine.tick().await.unwrap();
    assert_eq!(report.skipped, 2);
    assert_eq!(report.dead_lettered, 0);
    assert_eq!(h.prefixes(), vec![ASSIGNED_PREFIX.to_string()]);

    let counts = h.db.counts().await.unwrap();
    assert_eq!(counts.delivered, 2);
    assert_eq!(counts.pending, 0);
}
