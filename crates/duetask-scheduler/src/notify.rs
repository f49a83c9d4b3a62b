//! Notification messages — built fresh for every send, never mutated.

use chrono::{DateTime, Utc};
use duetask_core::Task;
use serde::{Deserialize, Serialize};

/// Prefix of the immediate notice sent when a task is created.
pub const ASSIGNED_PREFIX: &str = "New task assigned";
/// Prefix of the pre-due warning.
pub const DUE_SOON_PREFIX: &str = "Task due soon";
/// Prefix of the overdue notice.
pub const OVERDUE_PREFIX: &str = "Task overdue";

/// Length of the due-date text shown in a message.
const DUE_TEXT_LEN: usize = 21;

/// A push message for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub recipient_user_id: String,
    pub body: String,
}

impl NotificationMessage {
    pub fn new(recipient_user_id: &str, body: String) -> Self {
        Self {
            recipient_user_id: recipient_user_id.to_string(),
            body,
        }
    }
}

/// Format the message body for a task:
///
/// ```text
/// {prefix}
/// Topic: {topic}
/// Due: Wed Oct 14 2026 10:15
/// ```
pub fn build_message(task: &Task, prefix: &str) -> String {
    format!(
        "{}\nTopic: {}\nDue: {}",
        prefix,
        task.topic,
        due_text(&task.due_date)
    )
}

/// First 21 characters of the date's text form (`%a %b %d %Y %H:%M:%S`),
/// i.e. weekday, date and time down to the minute.
fn due_text(due: &DateTime<Utc>) -> String {
    due.format("%a %b %d %Y %H:%M:%S")
        .to_string()
        .chars()
        .take(DUE_TEXT_LEN)
        .collect()
}
