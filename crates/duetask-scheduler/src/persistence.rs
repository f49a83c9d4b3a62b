//! SQLite-backed persistence for tasks and scheduled jobs.
//! Survives restarts: a job enqueued before a crash is still pending (or
//! leased and later recovered) when the process comes back.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use duetask_core::{Clock, SystemClock, Task, TaskStatus, TaskUpdate};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use crate::error::{StoreError, StoreResult};
use crate::jobs::{DeliveryState, JobCounts, JobKind, JobPayload, JobQueue, ScheduledJob, Scheduler};
use crate::store::TaskStore;

/// SQLite persistence store for all scheduler data.
pub struct SchedulerDb {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

const TASK_COLUMNS: &str =
    "id, topic, description, due_date, status, owner_id, created_at, updated_at";
const JOB_COLUMNS: &str = "id, kind, task_id, payload, fire_at_ms, state, attempts, last_error, lease_until_ms, created_at_ms";

impl SchedulerDb {
    /// Open or create the scheduler database.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        // WAL for concurrent readers while the runner writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        Self::from_connection(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        let db = Self {
            conn: Mutex::new(conn),
            clock: Arc::new(SystemClock),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Use `clock` for fire times, leases and timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> StoreResult<()> {
        self.conn()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                topic TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                due_date TEXT NOT NULL,          -- RFC 3339
                status TEXT NOT NULL DEFAULT 'TO_DO',
                owner_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_owner ON tasks(owner_id);

            CREATE TABLE IF NOT EXISTS scheduled_jobs (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,              -- 'warn', 'overdue'
                task_id TEXT NOT NULL,
                payload TEXT NOT NULL,           -- JSON {userId, taskId, dueDate}
                fire_at_ms INTEGER NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',  -- pending, running, delivered, dead
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                lease_until_ms INTEGER,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_due ON scheduled_jobs(state, fire_at_ms);
            CREATE INDEX IF NOT EXISTS idx_jobs_task ON scheduled_jobs(task_id);
            ",
        )?;
        Ok(())
    }

    // ─── Jobs (inspection) ──────────────────────────────────────

    pub fn get_job(&self, id: &str) -> StoreResult<Option<ScheduledJob>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE id = ?1");
        let raw = conn.query_row(&sql, params![id], JobRow::from_row).optional()?;
        raw.map(JobRow::into_job).transpose()
    }

    /// All jobs for a task, earliest fire time first.
    pub fn jobs_for_task(&self, task_id: &str) -> StoreResult<Vec<ScheduledJob>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE task_id = ?1 ORDER BY fire_at_ms, kind DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![task_id], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(JobRow::into_job).collect()
    }
}

// ─── Tasks ──────────────────────────────────────────────────────

#[async_trait]
impl TaskStore for SchedulerDb {
    async fn create(&self, task: Task) -> StoreResult<Task> {
        self.conn()?.execute(
            "INSERT INTO tasks (id, topic, description, due_date, status, owner_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                task.id,
                task.topic,
                task.description,
                task.due_date.to_rfc3339(),
                task.status.as_str(),
                task.owner_id,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )?;
        tracing::debug!(task_id = %task.id, "Task stored");
        Ok(task)
    }

    async fn find_by_id(&self, id: &str) -> StoreResult<Option<Task>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        let raw = conn.query_row(&sql, params![id], TaskRow::from_row).optional()?;
        raw.map(TaskRow::into_task).transpose()
    }

    async fn conditional_update_status(
        &self,
        id: &str,
        expected: &[TaskStatus],
        new_status: TaskStatus,
    ) -> StoreResult<u64> {
        if expected.is_empty() {
            return Ok(0);
        }
        let placeholders = (0..expected.len())
            .map(|i| format!("?{}", i + 4))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status IN ({placeholders})"
        );

        let now = self.clock.now().to_rfc3339();
        let mut values: Vec<String> = vec![new_status.as_str().to_string(), now, id.to_string()];
        values.extend(expected.iter().map(|s| s.as_str().to_string()));

        let changed = self.conn()?.execute(&sql, params_from_iter(values.iter()))?;
        Ok(changed as u64)
    }

    async fn update_status(&self, id: &str, new_status: TaskStatus) -> StoreResult<Option<Task>> {
        let changed = self
            .conditional_update_status(id, new_status.allowed_predecessors(), new_status)
            .await?;
        if changed == 0 {
            return match self.find_by_id(id).await? {
                Some(task) => Err(StoreError::InvalidTransition {
                    from: task.status,
                    to: new_status,
                }),
                None => Ok(None),
            };
        }
        self.find_by_id(id).await
    }

    async fn update(&self, id: &str, update: TaskUpdate) -> StoreResult<Option<Task>> {
        let changed = self.conn()?.execute(
            "UPDATE tasks SET topic = COALESCE(?1, topic), description = COALESCE(?2, description),
             due_date = COALESCE(?3, due_date), updated_at = ?4 WHERE id = ?5",
            params![
                update.topic,
                update.description,
                update.due_date.map(|d| d.to_rfc3339()),
                self.clock.now().to_rfc3339(),
                id,
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        tracing::debug!(task_id = %id, "Task edited");
        self.find_by_id(id).await
    }

    async fn delete(&self, id: &str) -> StoreResult<bool> {
        let changed = self
            .conn()?
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    async fn list_for_owner(&self, owner_id: &str) -> StoreResult<Vec<Task>> {
        let conn = self.conn()?;
        let sql =
            format!("SELECT {TASK_COLUMNS} FROM tasks WHERE owner_id = ?1 ORDER BY due_date");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![owner_id], TaskRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }
}

// ─── Job queue ──────────────────────────────────────────────────

#[async_trait]
impl Scheduler for SchedulerDb {
    async fn enqueue(
        &self,
        kind: JobKind,
        payload: &JobPayload,
        delay: Duration,
    ) -> StoreResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = self.clock.now();
        let fire_at = now + delay.max(Duration::zero());
        let body = serde_json::to_string(payload)?;

        self.conn()?.execute(
            "INSERT INTO scheduled_jobs
             (id, kind, task_id, payload, fire_at_ms, state, attempts, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?6)",
            params![
                id,
                kind.as_str(),
                payload.task_id,
                body,
                fire_at.timestamp_millis(),
                now.timestamp_millis(),
            ],
        )?;
        tracing::debug!(job_id = %id, %kind, task_id = %payload.task_id, fire_at = %fire_at, "Job enqueued");
        Ok(id)
    }
}

#[async_trait]
impl JobQueue for SchedulerDb {
    async fn claim_due(&self, limit: usize, lease: Duration) -> StoreResult<Vec<ScheduledJob>> {
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();
        let lease_until_ms = (now + lease).timestamp_millis();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let candidates: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM scheduled_jobs
                 WHERE state = 'pending' AND fire_at_ms <= ?1
                 ORDER BY fire_at_ms LIMIT ?2",
            )?;
            let ids = stmt
                .query_map(params![now_ms, limit as i64], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        let mut claimed_rows = Vec::with_capacity(candidates.len());
        for id in candidates {
            // Conditional on still being pending: another runner may have won.
            let changed = tx.execute(
                "UPDATE scheduled_jobs
                 SET state = 'running', attempts = attempts + 1, lease_until_ms = ?1, updated_at_ms = ?2
                 WHERE id = ?3 AND state = 'pending'",
                params![lease_until_ms, now_ms, id],
            )?;
            if changed == 1 {
                let sql = format!("SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE id = ?1");
                claimed_rows.push(tx.query_row(&sql, params![id], JobRow::from_row)?);
            }
        }
        tx.commit()?;

        claimed_rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn complete(&self, id: &str) -> StoreResult<()> {
        self.conn()?.execute(
            "UPDATE scheduled_jobs SET state = 'delivered', lease_until_ms = NULL, updated_at_ms = ?1
             WHERE id = ?2",
            params![self.clock.now().timestamp_millis(), id],
        )?;
        Ok(())
    }

    async fn retry(&self, id: &str, at: DateTime<Utc>, error: &str) -> StoreResult<()> {
        self.conn()?.execute(
            "UPDATE scheduled_jobs
             SET state = 'pending', fire_at_ms = ?1, last_error = ?2, lease_until_ms = NULL, updated_at_ms = ?3
             WHERE id = ?4",
            params![
                at.timestamp_millis(),
                error,
                self.clock.now().timestamp_millis(),
                id
            ],
        )?;
        Ok(())
    }

    async fn defer(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        self.conn()?.execute(
            "UPDATE scheduled_jobs
             SET state = 'pending', fire_at_ms = ?1, attempts = MAX(attempts - 1, 0),
                 lease_until_ms = NULL, updated_at_ms = ?2
             WHERE id = ?3",
            params![at.timestamp_millis(), self.clock.now().timestamp_millis(), id],
        )?;
        Ok(())
    }

    async fn dead_letter(&self, id: &str, error: &str) -> StoreResult<()> {
        self.conn()?.execute(
            "UPDATE scheduled_jobs SET state = 'dead', last_error = ?1, lease_until_ms = NULL, updated_at_ms = ?2
             WHERE id = ?3",
            params![error, self.clock.now().timestamp_millis(), id],
        )?;
        Ok(())
    }

    async fn recover_expired(&self) -> StoreResult<usize> {
        let now_ms = self.clock.now().timestamp_millis();
        let recovered = self.conn()?.execute(
            "UPDATE scheduled_jobs SET state = 'pending', lease_until_ms = NULL, updated_at_ms = ?1
             WHERE state = 'running' AND lease_until_ms <= ?1",
            params![now_ms],
        )?;
        if recovered > 0 {
            tracing::warn!(recovered, "Recovered jobs with expired leases");
        }
        Ok(recovered)
    }

    async fn counts(&self) -> StoreResult<JobCounts> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM scheduled_jobs GROUP BY state")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut counts = JobCounts::default();
        for (state, n) in rows {
            let n = n as u64;
            match DeliveryState::parse(&state) {
                Some(DeliveryState::Pending) => counts.pending = n,
                Some(DeliveryState::Running) => counts.running = n,
                Some(DeliveryState::Delivered) => counts.delivered = n,
                Some(DeliveryState::Dead) => counts.dead = n,
                None => tracing::warn!("Unknown job state in database: {state}"),
            }
        }
        Ok(counts)
    }
}

// ─── Row mapping ────────────────────────────────────────────────

struct TaskRow {
    id: String,
    topic: String,
    description: String,
    due_date: String,
    status: String,
    owner_id: String,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            topic: row.get(1)?,
            description: row.get(2)?,
            due_date: row.get(3)?,
            status: row.get(4)?,
            owner_id: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_task(self) -> StoreResult<Task> {
        let status = self
            .status
            .parse::<TaskStatus>()
            .map_err(|e| StoreError::Corrupt(format!("task {}: {e}", self.id)))?;
        Ok(Task {
            due_date: parse_time(&self.due_date)?,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            id: self.id,
            topic: self.topic,
            description: self.description,
            status,
            owner_id: self.owner_id,
        })
    }
}

struct JobRow {
    id: String,
    kind: String,
    task_id: String,
    payload: String,
    fire_at_ms: i64,
    state: String,
    attempts: u32,
    last_error: Option<String>,
    lease_until_ms: Option<i64>,
    created_at_ms: i64,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            task_id: row.get(2)?,
            payload: row.get(3)?,
            fire_at_ms: row.get(4)?,
            state: row.get(5)?,
            attempts: row.get(6)?,
            last_error: row.get(7)?,
            lease_until_ms: row.get(8)?,
            created_at_ms: row.get(9)?,
        })
    }

    fn into_job(self) -> StoreResult<ScheduledJob> {
        let state = DeliveryState::parse(&self.state)
            .ok_or_else(|| StoreError::Corrupt(format!("job {}: state '{}'", self.id, self.state)))?;
        // An unparsable payload is kept as a JSON string so the runner can dead-letter it.
        let payload = serde_json::from_str(&self.payload)
            .unwrap_or(serde_json::Value::String(self.payload));
        Ok(ScheduledJob {
            fire_at: from_millis(self.fire_at_ms)?,
            lease_until: self.lease_until_ms.map(from_millis).transpose()?,
            created_at: from_millis(self.created_at_ms)?,
            id: self.id,
            kind: self.kind,
            task_id: self.task_id,
            payload,
            state,
            attempts: self.attempts,
            last_error: self.last_error,
        })
    }
}

fn parse_time(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{s}': {e}")))
}

fn from_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {ms}ms out of range")))
}
