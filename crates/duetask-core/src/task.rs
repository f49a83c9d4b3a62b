//! Task definitions — the record whose due date drives scheduled work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DuetaskError, Result};

/// A user's task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique task ID (UUID v4).
    pub id: String,
    pub topic: String,
    pub description: String,
    /// When the task becomes overdue.
    pub due_date: DateTime<Utc>,
    pub status: TaskStatus,
    /// Owning user.
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Task status.
///
/// `Done` is set only by user-driven updates; the scheduler never moves a
/// task out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    ToDo,
    InProgress,
    Overdue,
    Done,
}

impl TaskStatus {
    /// Statuses from which a task can still become overdue or receive a warning.
    pub const OPEN: [TaskStatus; 2] = [TaskStatus::ToDo, TaskStatus::InProgress];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::ToDo => "TO_DO",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Overdue => "OVERDUE",
            TaskStatus::Done => "DONE",
        }
    }

    /// Whether the task is still open (`TO_DO` or `IN_PROGRESS`).
    pub fn is_open(&self) -> bool {
        Self::OPEN.contains(self)
    }

    /// Statuses a task may be in for a user-driven move to `self`.
    ///
    /// Status only moves forward: `TO_DO → IN_PROGRESS → OVERDUE → DONE`,
    /// skipping allowed. A task that is `OVERDUE` or `DONE` is never reopened,
    /// since its overdue job has already been delivered.
    pub fn allowed_predecessors(&self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::ToDo => &[TaskStatus::ToDo],
            TaskStatus::InProgress => &[TaskStatus::ToDo, TaskStatus::InProgress],
            TaskStatus::Overdue => &[TaskStatus::ToDo, TaskStatus::InProgress, TaskStatus::Overdue],
            TaskStatus::Done => &[
                TaskStatus::ToDo,
                TaskStatus::InProgress,
                TaskStatus::Overdue,
                TaskStatus::Done,
            ],
        }
    }

    /// Whether a task in `current` may be moved to `self`.
    pub fn can_follow(&self, current: TaskStatus) -> bool {
        self.allowed_predecessors().contains(&current)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = DuetaskError;

    /// Accepts both the stored form (`IN_PROGRESS`) and CLI-friendly
    /// spellings (`in_progress`, `in-progress`).
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().replace('-', "_").as_str() {
            "TO_DO" | "TODO" => Ok(TaskStatus::ToDo),
            "IN_PROGRESS" => Ok(TaskStatus::InProgress),
            "OVERDUE" => Ok(TaskStatus::Overdue),
            "DONE" => Ok(TaskStatus::Done),
            _ => Err(DuetaskError::InvalidStatus(s.to_string())),
        }
    }
}

/// Input for creating a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub topic: String,
    #[serde(default)]
    pub description: String,
    pub due_date: DateTime<Utc>,
}

/// Partial edit of a task's content. `None` fields are left as they are.
///
/// Editing `due_date` does not move the reminders already scheduled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    pub topic: Option<String>,
    pub description: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
}

impl TaskUpdate {
    pub fn is_empty(&self) -> bool {
        self.topic.is_none() && self.description.is_none() && self.due_date.is_none()
    }
}

impl Task {
    /// Apply `update` in place and stamp `updated_at`.
    pub fn apply(&mut self, update: TaskUpdate, now: DateTime<Utc>) {
        if let Some(topic) = update.topic {
            self.topic = topic;
        }
        if let Some(description) = update.description {
            self.description = description;
        }
        if let Some(due_date) = update.due_date {
            self.due_date = due_date;
        }
        self.updated_at = now;
    }

    /// Build a fresh `TO_DO` task with a new ID.
    pub fn new(input: NewTask, owner_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: input.topic,
            description: input.description,
            due_date: input.due_date,
            status: TaskStatus::ToDo,
            owner_id: owner_id.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Parse a due date given either as RFC 3339 or as an offset from `now`
/// such as `+15m`, `+2h`, `+1d`, `+30s`.
pub fn parse_due_date(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if let Some(offset) = input.strip_prefix('+') {
        let split = offset
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| DuetaskError::InvalidDueDate(input.to_string()))?;
        let (amount, unit) = offset.split_at(split);
        let amount: i64 = amount
            .parse()
            .map_err(|_| DuetaskError::InvalidDueDate(input.to_string()))?;
        let delta = match unit {
            "s" => chrono::Duration::try_seconds(amount),
            "m" => chrono::Duration::try_minutes(amount),
            "h" => chrono::Duration::try_hours(amount),
            "d" => chrono::Duration::try_days(amount),
            _ => return Err(DuetaskError::InvalidDueDate(input.to_string())),
        };
        return delta
            .and_then(|delta| now.checked_add_signed(delta))
            .ok_or_else(|| DuetaskError::InvalidDueDate(format!("{input}: out of range")));
    }

    DateTime::parse_from_rfc3339(input)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| DuetaskError::InvalidDueDate(format!("{input}: {e}")))
}
