//! Task service, the entry points the API layer calls.
//!
//! Submission writes the task and its first dispatch entry; everything else
//! here is a read or an administrative delete.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use herald_common::types::{NewTask, Task, TaskStatusView};

use crate::error::DeliveryError;
use crate::queue::DispatchQueue;
use crate::store::{DeleteOutcome, RescheduleOutcome, TaskStore};

/// Page size used when the caller does not ask for one.
pub const DEFAULT_PAGE_SIZE: i64 = 100;
pub const MAX_PAGE_SIZE: i64 = 1_000;

#[derive(Clone)]
pub struct TaskService {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn DispatchQueue>,
    max_payload_bytes: usize,
}

impl TaskService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn DispatchQueue>,
        max_payload_bytes: usize,
    ) -> Self {
        Self {
            store,
            queue,
            max_payload_bytes,
        }
    }

    /// Create a `pending` task and enqueue its first dispatch entry.
    ///
    /// If the queue rejects the entry the task row is removed again and
    /// `QueueUnavailable` is returned, so a caller never sees an accepted
    /// task that nothing will dispatch. Should that cleanup fail too, the
    /// recovery sweep picks the orphan up.
    pub async fn submit(&self, new_task: NewTask) -> Result<Task, DeliveryError> {
        self.validate(&new_task)?;

        let task = self.store.insert(new_task, Utc::now()).await?;

        if let Err(err) = self.queue.enqueue(task.id, task.scheduled_at).await {
            tracing::error!(task_id = %task.id, error = %err, "Enqueue failed, withdrawing task");
            if let Err(cleanup) = self.store.delete(task.id).await {
                tracing::warn!(
                    task_id = %task.id,
                    error = %cleanup,
                    "Could not withdraw task; recovery sweep will dispatch it"
                );
            }
            return Err(err);
        }

        tracing::info!(
            task_id = %task.id,
            destination = %task.destination,
            scheduled_at = ?task.scheduled_at,
            "Task submitted"
        );
        Ok(task)
    }

    pub async fn get(&self, task_id: Uuid) -> Result<Task, DeliveryError> {
        self.store
            .get(task_id)
            .await?
            .ok_or(DeliveryError::NotFound(task_id))
    }

    pub async fn get_status(&self, task_id: Uuid) -> Result<TaskStatusView, DeliveryError> {
        Ok(self.get(task_id).await?.status_view())
    }

    pub async fn list(&self, skip: Option<i64>, limit: Option<i64>) -> Result<Vec<Task>, DeliveryError> {
        let skip = skip.unwrap_or(0).max(0);
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        self.store.list(skip, limit).await
    }

    /// Move a `pending` task to a new `scheduled_at` and enqueue an entry for
    /// that time.
    ///
    /// The entry from the previous schedule stays queued: if it comes due
    /// first, the claim answers `NotYetDue` and it is deferred. If the new
    /// entry cannot be enqueued the change is still persisted and
    /// `QueueUnavailable` is returned; repeating the call is safe.
    pub async fn reschedule(
        &self,
        task_id: Uuid,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<Task, DeliveryError> {
        let task = match self.store.reschedule(task_id, scheduled_at, Utc::now()).await? {
            RescheduleOutcome::Rescheduled(task) => task,
            RescheduleOutcome::NotPending(status) => {
                return Err(DeliveryError::Conflict(format!(
                    "Task {} is {} and can no longer be rescheduled",
                    task_id, status
                )));
            }
            RescheduleOutcome::NotFound => return Err(DeliveryError::NotFound(task_id)),
        };

        self.queue.enqueue(task.id, task.scheduled_at).await?;
        tracing::info!(task_id = %task.id, scheduled_at = ?task.scheduled_at, "Task rescheduled");
        Ok(task)
    }

    /// Administrative delete. Refuses tasks that are currently being delivered.
    pub async fn delete(&self, task_id: Uuid) -> Result<Task, DeliveryError> {
        match self.store.delete(task_id).await? {
            DeleteOutcome::Deleted(task) => {
                tracing::info!(task_id = %task_id, status = %task.status, "Task deleted");
                Ok(task)
            }
            DeleteOutcome::InFlight => Err(DeliveryError::Conflict(format!(
                "Task {} is being delivered and cannot be deleted",
                task_id
            ))),
            DeleteOutcome::NotFound => Err(DeliveryError::NotFound(task_id)),
        }
    }

    fn validate(&self, new_task: &NewTask) -> Result<(), DeliveryError> {
        if new_task.destination.trim().is_empty() {
            return Err(DeliveryError::Validation("destination must not be empty".to_string()));
        }
        if new_task.payload.is_empty() {
            return Err(DeliveryError::Validation("payload must not be empty".to_string()));
        }
        if new_task.payload.len() > self.max_payload_bytes {
            return Err(DeliveryError::Validation(format!(
                "payload exceeds {} bytes",
                self.max_payload_bytes
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use herald_common::types::TaskStatus;

    use crate::memory::{InMemoryQueue, InMemoryTaskStore};

    fn service() -> (TaskService, Arc<InMemoryTaskStore>, Arc<InMemoryQueue>) {
        let store = Arc::new(InMemoryTaskStore::new());
        let queue = Arc::new(InMemoryQueue::new(Duration::from_secs(30)));
        (TaskService::new(store.clone(), queue.clone(), 64), store, queue)
    }

    fn new_task() -> NewTask {
        NewTask {
            destination: "42".to_string(),
            payload: "hi".to_string(),
            scheduled_at: None,
        }
    }

    #[tokio::test]
    async fn test_submit_creates_pending_and_enqueues() {
        let (service, _, queue) = service();
        let task = service.submit(new_task()).await.unwrap();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt_count, 0);
        assert!(queue.has_pending(task.id).await.unwrap());

        let status = service.get_status(task.id).await.unwrap();
        assert_eq!(status.status, TaskStatus::Pending);
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn test_submit_fails_loudly_when_queue_down() {
        let (service, store, queue) = service();
        queue.set_unavailable(true);

        let err = service.submit(new_task()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::QueueUnavailable(_)));
        assert!(store.list(0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_destination() {
        let (service, _, _) = service();
        let err = service
            .submit(NewTask {
                destination: "  ".to_string(),
                ..new_task()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Validation(_)));
    }

    #[tokio::test]
    async fn test_submit_rejects_payload_over_configured_limit() {
        let (service, store, _) = service();
        let err = service
            .submit(NewTask {
                payload: "x".repeat(65),
                ..new_task()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Validation(_)));
        assert!(store.list(0, 10).await.unwrap().is_empty());

        let task = service
            .submit(NewTask {
                payload: "x".repeat(64),
                ..new_task()
            })
            .await
            .unwrap();
        assert_eq!(task.payload.len(), 64);
    }

    #[tokio::test]
    async fn test_get_status_unknown_task() {
        let (service, _, _) = service();
        let err = service.get_status(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_paginates() {
        let (service, _, _) = service();
        for _ in 0..5 {
            service.submit(new_task()).await.unwrap();
        }
        assert_eq!(service.list(None, None).await.unwrap().len(), 5);
        assert_eq!(service.list(Some(3), Some(10)).await.unwrap().len(), 2);
        assert_eq!(service.list(None, Some(2)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_in_flight_conflicts() {
        let (service, store, _) = service();
        let task = service.submit(new_task()).await.unwrap();
        store.try_claim(task.id, Utc::now()).await.unwrap();

        let err = service.delete(task.id).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_reschedule_pending_enqueues_at_new_time() {
        let (service, _, queue) = service();
        let task = service.submit(new_task()).await.unwrap();
        let at = Utc::now() + chrono::TimeDelta::hours(1);

        let moved = service.reschedule(task.id, Some(at)).await.unwrap();
        assert_eq!(moved.scheduled_at, Some(at));
        assert_eq!(moved.status, TaskStatus::Pending);
        // Original entry plus the one at the new time.
        assert_eq!(queue.ready_len().await, 2);
        assert_eq!(service.get(task.id).await.unwrap().scheduled_at, Some(at));
    }

    #[tokio::test]
    async fn test_reschedule_in_flight_conflicts() {
        let (service, store, queue) = service();
        let task = service.submit(new_task()).await.unwrap();
        store.try_claim(task.id, Utc::now()).await.unwrap();

        let err = service
            .reschedule(task.id, Some(Utc::now() + chrono::TimeDelta::hours(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Conflict(_)));
        assert!(store.get(task.id).await.unwrap().unwrap().scheduled_at.is_none());
        assert_eq!(queue.ready_len().await, 1);
    }

    #[tokio::test]
    async fn test_reschedule_unknown_task() {
        let (service, _, _) = service();
        let err = service.reschedule(Uuid::new_v4(), None).await.unwrap_err();
        assert!(matches!(err, DeliveryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_pending() {
        let (service, _, _) = service();
        let task = service.submit(new_task()).await.unwrap();
        let deleted = service.delete(task.id).await.unwrap();
        assert_eq!(deleted.id, task.id);
        assert!(matches!(
            service.get(task.id).await.unwrap_err(),
            DeliveryError::NotFound(_)
        ));
    }
}
