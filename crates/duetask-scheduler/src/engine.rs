//! Scheduler Engine — the loop that claims due jobs and runs their handlers.
//! Uses tokio::interval for ticking (sleeps between checks); every claimed
//! job runs as its own tokio task, bounded by a semaphore.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Duration;
use duetask_core::Clock;
use duetask_core::config::SchedulerConfig;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::error::{JobError, StoreResult};
use crate::jobs::{JobHandler, JobKind, JobOutcome, JobQueue, RetryPolicy, ScheduledJob};

/// How a single delivery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Completed,
    Skipped,
    Deferred,
    Retried,
    DeadLettered,
    /// The queue itself failed while recording the result; the lease will
    /// expire and the job is redelivered.
    Unacknowledged,
}

/// Summary of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub recovered: usize,
    pub claimed: usize,
    pub completed: usize,
    pub skipped: usize,
    pub deferred: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub unacknowledged: usize,
}

impl TickReport {
    fn record(&mut self, resolution: Resolution) {
        match resolution {
            Resolution::Completed => self.completed += 1,
            Resolution::Skipped => self.skipped += 1,
            Resolution::Deferred => self.deferred += 1,
            Resolution::Retried => self.retried += 1,
            Resolution::DeadLettered => self.dead_lettered += 1,
            Resolution::Unacknowledged => self.unacknowledged += 1,
        }
    }
}

/// The job runner: claims due jobs and dispatches them to registered handlers.
pub struct SchedulerEngine {
    queue: Arc<dyn JobQueue>,
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    batch_size: usize,
    lease: Duration,
    poll_interval: std::time::Duration,
    permits: Arc<Semaphore>,
}

impl SchedulerEngine {
    /// Create a new scheduler engine.
    pub fn new(queue: Arc<dyn JobQueue>, clock: Arc<dyn Clock>, config: &SchedulerConfig) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
            clock,
            retry: RetryPolicy::from_config(&config.retry),
            batch_size: config.batch_size.max(1),
            lease: config.lease(),
            poll_interval: config.poll_interval(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
        }
    }

    /// Register the handler for a job kind (replaces any previous one).
    pub fn register(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        debug!(%kind, "Job handler registered");
        self.handlers.insert(kind, handler);
    }

    /// Recover expired leases, claim due jobs, run them concurrently
    /// and wait for the batch to finish.
    pub async fn tick(&self) -> StoreResult<TickReport> {
        let mut report = TickReport {
            recovered: self.queue.recover_expired().await?,
            ..TickReport::default()
        };

        let jobs = self.queue.claim_due(self.batch_size, self.lease).await?;
        report.claimed = jobs.len();
        if jobs.is_empty() {
            return Ok(report);
        }

        let mut running = Vec::with_capacity(jobs.len());
        for job in jobs {
            let run = JobRun {
                queue: Arc::clone(&self.queue),
                handlers: self.handlers.clone(),
                clock: Arc::clone(&self.clock),
                retry: self.retry.clone(),
            };
            let permits = Arc::clone(&self.permits);
            running.push(tokio::spawn(async move {
                // The semaphore is never closed.
                let _permit = permits.acquire_owned().await.ok();
                run.execute(job).await
            }));
        }

        for outcome in futures::future::join_all(running).await {
            match outcome {
                Ok(resolution) => report.record(resolution),
                Err(e) => {
                    // Handler panicked; its lease expires and the job is redelivered.
                    error!(error = %e, "Job task aborted");
                    report.record(Resolution::Unacknowledged);
                }
            }
        }

        info!(
            claimed = report.claimed,
            completed = report.completed,
            skipped = report.skipped,
            retried = report.retried,
            dead = report.dead_lettered,
            "Scheduler tick"
        );
        Ok(report)
    }

    /// Run ticks every `poll_interval` until `shutdown` resolves.
    pub async fn run<F>(self: Arc<Self>, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        info!(
            "⏰ Scheduler started (check every {}ms, {} handler kinds)",
            self.poll_interval.as_millis(),
            self.handlers.len()
        );

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Scheduler stopping");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "Scheduler tick failed");
                    }
                }
            }
        }
    }
}

/// Everything a spawned job needs, owned.
struct JobRun {
    queue: Arc<dyn JobQueue>,
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl JobRun {
    async fn execute(self, job: ScheduledJob) -> Resolution {
        let result = match job.decode() {
            Ok((kind, payload)) => match self.handlers.get(&kind) {
                Some(handler) => handler.handle(kind, &payload).await,
                None => Err(JobError::Permanent(format!("no handler registered for '{kind}'"))),
            },
            Err(e) => Err(e),
        };

        match self.resolve(&job, result).await {
            Ok(resolution) => resolution,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to record job result");
                Resolution::Unacknowledged
            }
        }
    }

    async fn resolve(
        &self,
        job: &ScheduledJob,
        result: Result<JobOutcome, JobError>,
    ) -> StoreResult<Resolution> {
        match result {
            Ok(JobOutcome::Completed) => {
                self.queue.complete(&job.id).await?;
                debug!(job_id = %job.id, kind = %job.kind, "Job delivered");
                Ok(Resolution::Completed)
            }
            Ok(JobOutcome::Skipped(reason)) => {
                self.queue.complete(&job.id).await?;
                debug!(job_id = %job.id, kind = %job.kind, ?reason, "Job stale, nothing to do");
                Ok(Resolution::Skipped)
            }
            Ok(JobOutcome::Deferred(at)) => {
                self.queue.defer(&job.id, at).await?;
                debug!(job_id = %job.id, kind = %job.kind, fire_at = %at, "Job deferred");
                Ok(Resolution::Deferred)
            }
            Err(e) if e.is_transient() && self.retry.should_retry(job.attempts) => {
                let at = self.clock.now() + self.retry.backoff(job.attempts);
                self.queue.retry(&job.id, at, &e.to_string()).await?;
                warn!(
                    job_id = %job.id,
                    kind = %job.kind,
                    attempt = job.attempts,
                    retry_at = %at,
                    error = %e,
                    "Job failed, will retry"
                );
                Ok(Resolution::Retried)
            }
            Err(e) => {
                self.queue.dead_letter(&job.id, &e.to_string()).await?;
                error!(
                    job_id = %job.id,
                    kind = %job.kind,
                    task_id = %job.task_id,
                    attempts = job.attempts,
                    error = %e,
                    "Job dead-lettered"
                );
                Ok(Resolution::DeadLettered)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{DeliveryState, JobPayload, Scheduler};
    use crate::persistence::SchedulerDb;
    use async_trait::async_trait;
    use chrono::Utc;
    use duetask_core::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with the configured error for the first `fail_times` calls.
    struct FlakyHandler {
        calls: AtomicU32,
        fail_times: u32,
        transient: bool,
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        async fn handle(&self, _: JobKind, _: &JobPayload) -> Result<JobOutcome, JobError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_times {
                if self.transient {
                    return Err(JobError::Transient("busy".into()));
                }
                return Err(JobError::Permanent("bad".into()));
            }
            Ok(JobOutcome::Completed)
        }
    }

    fn setup(max_attempts: u32) -> (Arc<SchedulerDb>, Arc<ManualClock>, SchedulerConfig) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap().with_clock(clock.clone()));
        let mut config = SchedulerConfig::default();
        config.retry.max_attempts = max_attempts;
        config.retry.base_delay_ms = 1000;
        config.retry.max_delay_ms = 1000;
        (db, clock, config)
    }

    fn payload() -> JobPayload {
        JobPayload {
            user_id: "u1".into(),
            task_id: "t1".into(),
            due_date: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_then_delivered() {
        let (db, clock, config) = setup(5);
        let mut engine = SchedulerEngine::new(db.clone(), clock.clone(), &config);
        let handler = Arc::new(FlakyHandler {
            calls: AtomicU32::new(0),
            fail_times: 1,
            transient: true,
        });
        engine.register(JobKind::Overdue, handler.clone());

        let id = db.enqueue(JobKind::Overdue, &payload(), Duration::zero()).await.unwrap();

        let report = engine.tick().await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(db.get_job(&id).unwrap().unwrap().state, DeliveryState::Pending);

        // Backoff not elapsed yet.
        assert_eq!(engine.tick().await.unwrap().claimed, 0);

        clock.advance(Duration::seconds(2));
        let report = engine.tick().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(db.get_job(&id).unwrap().unwrap().state, DeliveryState::Delivered);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_dead_lettered() {
        let (db, clock, config) = setup(5);
        let mut engine = SchedulerEngine::new(db.clone(), clock.clone(), &config);
        engine.register(
            JobKind::Warn,
            Arc::new(FlakyHandler {
                calls: AtomicU32::new(0),
                fail_times: 1,
                transient: false,
            }),
        );

        let id = db.enqueue(JobKind::Warn, &payload(), Duration::zero()).await.unwrap();
        let report = engine.tick().await.unwrap();
        assert_eq!(report.dead_lettered, 1);

        let job = db.get_job(&id).unwrap().unwrap();
        assert_eq!(job.state, DeliveryState::Dead);
        assert!(job.last_error.unwrap().contains("bad"));
    }

    #[tokio::test]
    async fn test_retries_exhausted_dead_letters() {
        let (db, clock, config) = setup(2);
        let mut engine = SchedulerEngine::new(db.clone(), clock.clone(), &config);
        engine.register(
            JobKind::Overdue,
            Arc::new(FlakyHandler {
                calls: AtomicU32::new(0),
                fail_times: u32::MAX,
                transient: true,
            }),
        );

        let id = db.enqueue(JobKind::Overdue, &payload(), Duration::zero()).await.unwrap();
        assert_eq!(engine.tick().await.unwrap().retried, 1);
        clock.advance(Duration::seconds(2));
        assert_eq!(engine.tick().await.unwrap().dead_lettered, 1);
        assert_eq!(db.get_job(&id).unwrap().unwrap().state, DeliveryState::Dead);
    }

    #[tokio::test]
    async fn test_missing_handler_dead_letters() {
        let (db, clock, config) = setup(5);
        let engine = SchedulerEngine::new(db.clone(), clock.clone(), &config);
        let id = db.enqueue(JobKind::Warn, &payload(), Duration::zero()).await.unwrap();

        assert_eq!(engine.tick().await.unwrap().dead_lettered, 1);
        assert_eq!(db.get_job(&id).unwrap().unwrap().state, DeliveryState::Dead);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (db, clock, mut config) = setup(5);
        config.poll_interval_ms = 5;
        let engine = Arc::new(SchedulerEngine::new(db, clock, &config));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(engine.run(async move {
            rx.await.ok();
        }));
        tx.send(()).ok();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
