//! Task record store boundary.
//!
//! The store is the single source of truth for task state. Every status
//! change goes through a conditional update here; nothing else serialises
//! concurrent workers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use herald_common::types::{NewTask, Task, TaskStatus};

use crate::error::DeliveryError;
use crate::machine::Transition;

/// Exclusive delivery rights for one attempt of a task.
///
/// The attempt number doubles as a fencing token: closing the attempt only
/// succeeds while the task is still `in_flight` with this attempt count.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    pub task: Task,
}

impl Claim {
    pub fn task_id(&self) -> Uuid {
        self.task.id
    }

    pub fn attempt(&self) -> i32 {
        self.task.attempt_count
    }
}

/// Result of the idempotency guard.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(Claim),
    AlreadyInFlight,
    AlreadyTerminal,
    /// Claimable, but not before the given time.
    NotYetDue(DateTime<Utc>),
    NotFound,
}

impl ClaimOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ClaimOutcome::Claimed(_) => "claimed",
            ClaimOutcome::AlreadyInFlight => "already_in_flight",
            ClaimOutcome::AlreadyTerminal => "already_terminal",
            ClaimOutcome::NotYetDue(_) => "not_yet_due",
            ClaimOutcome::NotFound => "not_found",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome {
    Deleted(Task),
    InFlight,
    NotFound,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RescheduleOutcome {
    Rescheduled(Task),
    /// Only `pending` tasks can be moved; carries the current status.
    NotPending(TaskStatus),
    NotFound,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new `pending` task.
    async fn insert(&self, new_task: NewTask, now: DateTime<Utc>) -> Result<Task, DeliveryError>;

    async fn get(&self, task_id: Uuid) -> Result<Option<Task>, DeliveryError>;

    /// Newest first.
    async fn list(&self, skip: i64, limit: i64) -> Result<Vec<Task>, DeliveryError>;

    /// Remove a task unless it is currently claimed.
    async fn delete(&self, task_id: Uuid) -> Result<DeleteOutcome, DeliveryError>;

    /// Move the first attempt of a `pending` task to `scheduled_at`
    /// (`None` = immediately). Any other status is left untouched.
    async fn reschedule(
        &self,
        task_id: Uuid,
        scheduled_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<RescheduleOutcome, DeliveryError>;

    /// Atomically move a claimable task to `in_flight` and bump its attempt
    /// count.
    ///
    /// Claimable means `pending` (and past `scheduled_at`, if set) or
    /// `failed_retryable` with `next_attempt_at <= now`.
    async fn try_claim(&self, task_id: Uuid, now: DateTime<Utc>)
    -> Result<ClaimOutcome, DeliveryError>;

    /// Close the attempt held by `claim`.
    ///
    /// Fails with `InvalidTransition` when the task is no longer `in_flight`
    /// under this attempt (e.g. the claim went stale and was recovered).
    async fn record_outcome(
        &self,
        claim: &Claim,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<Task, DeliveryError>;

    /// Force `in_flight` tasks last touched before `stale_before` out of
    /// their claim: back to `failed_retryable` (due at `now`), or to
    /// `failed_permanent` when `max_attempts` is already spent.
    async fn recover_stale(
        &self,
        stale_before: DateTime<Utc>,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>, DeliveryError>;

    /// `failed_retryable` tasks with `next_attempt_at <= now`.
    async fn due_retries(&self, now: DateTime<Utc>, limit: i64)
    -> Result<Vec<Task>, DeliveryError>;

    /// `pending` tasks created before `created_before`.
    async fn stale_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Task>, DeliveryError>;
}

pub(crate) const STALE_CLAIM_ERROR: &str = "claim expired before the attempt was recorded";

/// Classify a task the conditional claim did not match.
pub(crate) fn unclaimable_outcome(task: Option<&Task>, now: DateTime<Utc>) -> ClaimOutcome {
    let Some(task) = task else {
        return ClaimOutcome::NotFound;
    };
    match task.status {
        TaskStatus::InFlight => ClaimOutcome::AlreadyInFlight,
        status if status.is_terminal() => ClaimOutcome::AlreadyTerminal,
        _ => ClaimOutcome::NotYetDue(task.due_at().unwrap_or(now)),
    }
}
