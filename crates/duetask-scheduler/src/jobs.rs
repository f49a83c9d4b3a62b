//! Job definitions — the data model for delayed work.
//!
//! Two job kinds exist per task: `warn` fires `WARN_WINDOW` before the due
//! date, `overdue` fires at the due date. Both carry the same payload.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use duetask_core::TaskStatus;
use serde::{Deserialize, Serialize};

use crate::error::{JobError, StoreResult};

/// Kind of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Pre-due "due soon" notification.
    Warn,
    /// Overdue transition + notification.
    Overdue,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Warn => "warn",
            JobKind::Overdue => "overdue",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "warn" => Some(JobKind::Warn),
            "overdue" => Some(JobKind::Overdue),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload shared by both job kinds.
///
/// Wire form: `{"userId": "...", "taskId": "...", "dueDate": "<RFC 3339>"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub user_id: String,
    pub task_id: String,
    pub due_date: DateTime<Utc>,
}

/// Delivery state of a job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    /// Waiting for its fire time (or for a retry).
    Pending,
    /// Claimed by a runner; redelivered if the lease expires.
    Running,
    Delivered,
    /// Gave up: permanent failure or retries exhausted.
    Dead,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Running => "running",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryState::Pending),
            "running" => Some(DeliveryState::Running),
            "delivered" => Some(DeliveryState::Delivered),
            "dead" => Some(DeliveryState::Dead),
            _ => None,
        }
    }
}

/// A job as stored in the queue.
///
/// `kind` and `payload` are kept raw so a row that cannot be decoded is
/// still claimable and can be dead-lettered.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub id: String,
    pub kind: String,
    pub task_id: String,
    pub payload: serde_json::Value,
    pub fire_at: DateTime<Utc>,
    pub state: DeliveryState,
    /// Number of deliveries so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledJob {
    /// Decode kind and payload; anything unreadable is a permanent failure.
    pub fn decode(&self) -> Result<(JobKind, JobPayload), JobError> {
        let kind = JobKind::parse(&self.kind)
            .ok_or_else(|| JobError::Permanent(format!("unknown job kind '{}'", self.kind)))?;
        let payload: JobPayload = serde_json::from_value(self.payload.clone())
            .map_err(|e| JobError::Permanent(format!("invalid payload: {e}")))?;
        Ok((kind, payload))
    }
}

/// Why a handler decided not to act.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Task was deleted before the job fired.
    TaskMissing,
    /// Task is no longer `TO_DO`/`IN_PROGRESS`.
    NotOpen(TaskStatus),
    /// Conditional update affected zero rows.
    StaleState,
}

/// Successful result of a handler run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The event was acted on.
    Completed,
    /// The event was stale; nothing changed.
    Skipped(SkipReason),
    /// Delivered too early; run again at the given time.
    Deferred(DateTime<Utc>),
}

/// Per-state job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: u64,
    pub running: u64,
    pub delivered: u64,
    pub dead: u64,
}

/// Producer side of the delayed-job queue.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Persist a job to fire at `now + delay`. Returns the job ID.
    async fn enqueue(&self, kind: JobKind, payload: &JobPayload, delay: Duration)
    -> StoreResult<String>;
}

/// Runner side of the delayed-job queue.
#[async_trait]
pub trait JobQueue: Scheduler {
    /// Lease up to `limit` due jobs. A job is claimed by at most one caller.
    async fn claim_due(&self, limit: usize, lease: Duration) -> StoreResult<Vec<ScheduledJob>>;

    /// Mark a job delivered.
    async fn complete(&self, id: &str) -> StoreResult<()>;

    /// Put a failed job back to pending at `at`.
    async fn retry(&self, id: &str, at: DateTime<Utc>, error: &str) -> StoreResult<()>;

    /// Put a job back to pending at `at` without counting the delivery.
    async fn defer(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()>;

    async fn dead_letter(&self, id: &str, error: &str) -> StoreResult<()>;

    /// Return jobs with an expired lease to pending. Returns how many.
    async fn recover_expired(&self) -> StoreResult<usize>;

    async fn counts(&self) -> StoreResult<JobCounts>;
}

/// Handler invoked by the job runner for a claimed job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, kind: JobKind, payload: &JobPayload) -> Result<JobOutcome, JobError>;
}

/// Backoff policy for transient handler failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &duetask_core::config::RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
        }
    }

    /// Whether another delivery is allowed after `attempts` deliveries.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before the next delivery: `base * 2^(attempts-1)`, capped,
    /// plus up to 10% jitter.
    pub fn backoff(&self, attempts: u32) -> Duration {
        use rand::Rng;

        let exp = attempts.saturating_sub(1).min(20);
        let base_ms = self.base_delay.num_milliseconds().max(0);
        let capped = base_ms
            .saturating_mul(1_i64 << exp)
            .min(self.max_delay.num_milliseconds().max(0));
        let jitter = if capped >= 10 {
            rand::thread_rng().gen_range(0..=capped / 10)
        } else {
            0
        };
        Duration::milliseconds(capped + jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&duetask_core::config::RetryConfig::default())
    }
}
