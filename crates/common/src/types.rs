use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery status of a notification task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InFlight,
    Delivered,
    FailedRetryable,
    FailedPermanent,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::InFlight,
        TaskStatus::Delivered,
        TaskStatus::FailedRetryable,
        TaskStatus::FailedPermanent,
    ];

    /// `delivered` and `failed_permanent` never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Delivered | TaskStatus::FailedPermanent)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InFlight => write!(f, "in_flight"),
            TaskStatus::Delivered => write!(f, "delivered"),
            TaskStatus::FailedRetryable => write!(f, "failed_retryable"),
            TaskStatus::FailedPermanent => write!(f, "failed_permanent"),
        }
    }
}

/// A notification task as persisted in the `tasks` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Task {
    pub id: Uuid,
    /// Recipient chat/channel identifier, opaque to the pipeline
    pub destination: String,
    /// Message body
    pub payload: String,
    pub status: TaskStatus,
    /// Number of claimed delivery attempts so far
    pub attempt_count: i32,
    /// Set only while the task is `failed_retryable`
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Earliest time the first attempt may run (`None` = immediately)
    pub scheduled_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build a fresh `pending` task.
    pub fn new(new_task: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            destination: new_task.destination,
            payload: new_task.payload,
            status: TaskStatus::Pending,
            attempt_count: 0,
            next_attempt_at: None,
            scheduled_at: new_task.scheduled_at,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// When the task may next be claimed, if it is waiting on a timestamp.
    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            TaskStatus::Pending => self.scheduled_at,
            TaskStatus::FailedRetryable => self.next_attempt_at,
            _ => None,
        }
    }

    pub fn status_view(&self) -> TaskStatusView {
        TaskStatusView {
            id: self.id,
            status: self.status,
            attempt_count: self.attempt_count,
            last_error: self.last_error.clone(),
            next_attempt_at: self.next_attempt_at,
            scheduled_at: self.scheduled_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Input for submitting a new task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub destination: String,
    pub payload: String,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Input for moving a `pending` task's first attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescheduleTask {
    /// New earliest delivery time; `null` sends as soon as possible.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Read-only delivery status of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub id: Uuid,
    pub status: TaskStatus,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
