//! PostgreSQL task store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use herald_common::types::{NewTask, Task, TaskStatus};

use crate::error::DeliveryError;
use crate::machine::Transition;
use crate::store::{
    Claim, ClaimOutcome, DeleteOutcome, RescheduleOutcome, STALE_CLAIM_ERROR, TaskStore,
    unclaimable_outcome,
};

#[derive(Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn insert(&self, new_task: NewTask, now: DateTime<Utc>) -> Result<Task, DeliveryError> {
        let task: Task = sqlx::query_as(
            r#"
            INSERT INTO tasks (id, destination, payload, status, attempt_count, scheduled_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 0, $5, $6, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new_task.destination)
        .bind(&new_task.payload)
        .bind(TaskStatus::Pending.to_string())
        .bind(new_task.scheduled_at)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(task)
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<Task>, DeliveryError> {
        let task: Option<Task> = sqlx::query_as("SELECT * FROM tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(task)
    }

    async fn list(&self, skip: i64, limit: i64) -> Result<Vec<Task>, DeliveryError> {
        let tasks: Vec<Task> =
            sqlx::query_as("SELECT * FROM tasks ORDER BY created_at DESC, id OFFSET $1 LIMIT $2")
                .bind(skip)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;

        Ok(tasks)
    }

    async fn delete(&self, task_id: Uuid) -> Result<DeleteOutcome, DeliveryError> {
        let deleted: Option<Task> =
            sqlx::query_as("DELETE FROM tasks WHERE id = $1 AND status <> $2 RETURNING *")
                .bind(task_id)
                .bind(TaskStatus::InFlight.to_string())
                .fetch_optional(&self.pool)
                .await?;

        if let Some(task) = deleted {
            return Ok(DeleteOutcome::Deleted(task));
        }

        Ok(match self.get(task_id).await? {
            Some(_) => DeleteOutcome::InFlight,
            None => DeleteOutcome::NotFound,
        })
    }

    async fn reschedule(
        &self,
        task_id: Uuid,
        scheduled_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<RescheduleOutcome, DeliveryError> {
        // Same row lock as the claim, so a task cannot be moved once claimed.
        let updated: Option<Task> = sqlx::query_as(
            r#"
            UPDATE tasks
            SET scheduled_at = $2, updated_at = $3
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(task_id)
        .bind(scheduled_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(task) = updated {
            return Ok(RescheduleOutcome::Rescheduled(task));
        }

        Ok(match self.get(task_id).await? {
            Some(current) => RescheduleOutcome::NotPending(current.status),
            None => RescheduleOutcome::NotFound,
        })
    }

    async fn try_claim(
        &self,
        task_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, DeliveryError> {
        // The only serialisation point between workers: one conditional update.
        let claimed: Option<Task> = sqlx::query_as(
            r#"
            UPDATE tasks
            SET status = 'in_flight',
                attempt_count = attempt_count + 1,
                next_attempt_at = NULL,
                updated_at = $2
            WHERE id = $1
              AND (
                    (status = 'pending' AND (scheduled_at IS NULL OR scheduled_at <= $2))
                 OR (status = 'failed_retryable' AND next_attempt_at <= $2)
              )
            RETURNING *
            "#,
        )
        .bind(task_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(task) = claimed {
            return Ok(ClaimOutcome::Claimed(Claim { task }));
        }

        let current = self.get(task_id).await?;
        Ok(unclaimable_outcome(current.as_ref(), now))
    }

    async fn record_outcome(
        &self,
        claim: &Claim,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<Task, DeliveryError> {
        let (last_error, next_attempt_at) = match transition {
            Transition::Delivered => (None, None),
            Transition::Retry {
                next_attempt_at,
                error,
            } => (Some(error.as_str()), Some(*next_attempt_at)),
            Transition::Fail { error } => (Some(error.as_str()), None),
        };

        let updated: Option<Task> = sqlx::query_as(
            r#"
            UPDATE tasks
            SET status = $3, last_error = $4, next_attempt_at = $5, updated_at = $6
            WHERE id = $1 AND status = 'in_flight' AND attempt_count = $2
            RETURNING *
            "#,
        )
        .bind(claim.task_id())
        .bind(claim.attempt())
        .bind(transition.target().to_string())
        .bind(last_error)
        .bind(next_attempt_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(task) = updated {
            return Ok(task);
        }

        match self.get(claim.task_id()).await? {
            Some(current) => Err(DeliveryError::InvalidTransition {
                task_id: current.id,
                from: current.status,
                to: transition.target(),
            }),
            None => Err(DeliveryError::NotFound(claim.task_id())),
        }
    }

    async fn recover_stale(
        &self,
        stale_before: DateTime<Utc>,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>, DeliveryError> {
        let recovered: Vec<Task> = sqlx::query_as(
            r#"
            UPDATE tasks
            SET status = CASE WHEN attempt_count >= $2 THEN 'failed_permanent' ELSE 'failed_retryable' END,
                next_attempt_at = CASE WHEN attempt_count >= $2 THEN NULL ELSE $3 END,
                last_error = $4,
                updated_at = $3
            WHERE status = 'in_flight' AND updated_at < $1
            RETURNING *
            "#,
        )
        .bind(stale_before)
        .bind(max_attempts)
        .bind(now)
        .bind(STALE_CLAIM_ERROR)
        .fetch_all(&self.pool)
        .await?;

        Ok(recovered)
    }

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Task>, DeliveryError> {
        let tasks: Vec<Task> = sqlx::query_as(
            r#"
            SELECT * FROM tasks
            WHERE status = 'failed_retryable' AND next_attempt_at <= $1
            ORDER BY next_attempt_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(tasks)
    }

    async fn stale_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Task>, DeliveryError> {
        let tasks: Vec<Task> = sqlx::query_as(
            r#"
            SELECT * FROM tasks
            WHERE status = 'pending' AND created_at < $1
            ORDER BY created_at
            LIMIT $2
            "#,
        )
        .bind(created_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(tasks)
    }
}
