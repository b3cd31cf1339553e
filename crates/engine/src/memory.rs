//! In-process task store and dispatch queue.
//!
//! Same semantics as the Postgres store and Redis queue, minus durability.
//! Used by the test suites and for single-process runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use herald_common::types::{NewTask, Task, TaskStatus};

use crate::error::DeliveryError;
use crate::machine::{Transition, check_transition};
use crate::queue::{DispatchEntry, DispatchQueue};
use crate::store::{
    Claim, ClaimOutcome, DeleteOutcome, RescheduleOutcome, STALE_CLAIM_ERROR, TaskStore,
    unclaimable_outcome,
};

#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: Mutex<HashMap<Uuid, Task>>,
    fail_outcome_writes: AtomicBool,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `record_outcome` fail with `StorageUnavailable` until reset.
    pub fn fail_outcome_writes(&self, fail: bool) {
        self.fail_outcome_writes.store(fail, Ordering::SeqCst);
    }

    /// Overwrite a stored task as-is, bypassing the state machine.
    pub async fn put(&self, task: Task) {
        self.tasks.lock().await.insert(task.id, task);
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, new_task: NewTask, now: DateTime<Utc>) -> Result<Task, DeliveryError> {
        let task = Task::new(new_task, now);
        self.tasks.lock().await.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<Task>, DeliveryError> {
        Ok(self.tasks.lock().await.get(&task_id).cloned())
    }

    async fn list(&self, skip: i64, limit: i64) -> Result<Vec<Task>, DeliveryError> {
        let mut tasks: Vec<Task> = self.tasks.lock().await.values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks
            .into_iter()
            .skip(skip.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn delete(&self, task_id: Uuid) -> Result<DeleteOutcome, DeliveryError> {
        let mut tasks = self.tasks.lock().await;
        match tasks.get(&task_id).map(|t| t.status) {
            None => Ok(DeleteOutcome::NotFound),
            Some(TaskStatus::InFlight) => Ok(DeleteOutcome::InFlight),
            Some(_) => Ok(tasks
                .remove(&task_id)
                .map(DeleteOutcome::Deleted)
                .unwrap_or(DeleteOutcome::NotFound)),
        }
    }

    async fn reschedule(
        &self,
        task_id: Uuid,
        scheduled_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<RescheduleOutcome, DeliveryError> {
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.get_mut(&task_id) else {
            return Ok(RescheduleOutcome::NotFound);
        };
        if task.status != TaskStatus::Pending {
            return Ok(RescheduleOutcome::NotPending(task.status));
        }
        task.scheduled_at = scheduled_at;
        task.updated_at = now;
        Ok(RescheduleOutcome::Rescheduled(task.clone()))
    }

    async fn try_claim(
        &self,
        task_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, DeliveryError> {
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.get_mut(&task_id) else {
            return Ok(ClaimOutcome::NotFound);
        };

        let claimable = match task.status {
            TaskStatus::Pending => task.scheduled_at.is_none_or(|at| at <= now),
            TaskStatus::FailedRetryable => task.next_attempt_at.is_some_and(|at| at <= now),
            _ => false,
        };
        if !claimable {
            return Ok(unclaimable_outcome(Some(task), now));
        }

        check_transition(task.id, task.status, TaskStatus::InFlight)?;
        task.status = TaskStatus::InFlight;
        task.attempt_count += 1;
        task.next_attempt_at = None;
        task.updated_at = now;

        Ok(ClaimOutcome::Claimed(Claim { task: task.clone() }))
    }

    async fn record_outcome(
        &self,
        claim: &Claim,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<Task, DeliveryError> {
        if self.fail_outcome_writes.load(Ordering::SeqCst) {
            return Err(DeliveryError::StorageUnavailable(
                "in-memory store rejecting writes".to_string(),
            ));
        }

        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(&claim.task_id())
            .ok_or(DeliveryError::NotFound(claim.task_id()))?;

        if task.status == TaskStatus::InFlight && task.attempt_count != claim.attempt() {
            // Re-claimed by someone else after our claim went stale.
            return Err(DeliveryError::InvalidTransition {
                task_id: task.id,
                from: task.status,
                to: transition.target(),
            });
        }

        transition.apply(task, now)?;
        Ok(task.clone())
    }

    async fn recover_stale(
        &self,
        stale_before: DateTime<Utc>,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>, DeliveryError> {
        let mut tasks = self.tasks.lock().await;
        let mut recovered = Vec::new();

        for task in tasks.values_mut() {
            if task.status != TaskStatus::InFlight || task.updated_at >= stale_before {
                continue;
            }
            let transition = if task.attempt_count >= max_attempts {
                Transition::Fail {
                    error: STALE_CLAIM_ERROR.to_string(),
                }
            } else {
                Transition::Retry {
                    next_attempt_at: now,
                    error: STALE_CLAIM_ERROR.to_string(),
                }
            };
            transition.apply(task, now)?;
            recovered.push(task.clone());
        }

        Ok(recovered)
    }

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Task>, DeliveryError> {
        let tasks = self.tasks.lock().await;
        let mut due: Vec<Task> = tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::FailedRetryable
                    && t.next_attempt_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|t| t.next_attempt_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn stale_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Task>, DeliveryError> {
        let tasks = self.tasks.lock().await;
        let mut pending: Vec<Task> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && t.created_at < created_before)
            .cloned()
            .collect();
        pending.sort_by_key(|t| t.created_at);
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }
}

#[derive(Default)]
struct QueueState {
    /// (not-before millis, sequence) -> entry
    ready: BTreeMap<(i64, u64), DispatchEntry>,
    /// entry id -> (entry, visibility deadline)
    inflight: HashMap<Uuid, (DispatchEntry, DateTime<Utc>)>,
}

pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    seq: AtomicU64,
    visibility_timeout: Duration,
    unavailable: AtomicBool,
}

impl InMemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            seq: AtomicU64::new(0),
            visibility_timeout,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every operation fail with `QueueUnavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub async fn inflight_len(&self) -> usize {
        self.state.lock().await.inflight.len()
    }

    fn check_available(&self) -> Result<(), DeliveryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(DeliveryError::QueueUnavailable(
                "in-memory queue disabled".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn ready_key(&self, at: DateTime<Utc>) -> (i64, u64) {
        (
            at.timestamp_millis(),
            self.seq.fetch_add(1, Ordering::SeqCst),
        )
    }
}

#[async_trait]
impl DispatchQueue for InMemoryQueue {
    async fn enqueue(
        &self,
        task_id: Uuid,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<DispatchEntry, DeliveryError> {
        self.check_available()?;
        let entry = DispatchEntry::new(task_id);
        let key = self.ready_key(not_before.unwrap_or_else(Utc::now));
        self.state.lock().await.ready.insert(key, entry.clone());
        Ok(entry)
    }

    async fn dequeue(&self) -> Result<Option<DispatchEntry>, DeliveryError> {
        self.check_available()?;
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let expired: Vec<Uuid> = state
            .inflight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some((entry, _)) = state.inflight.remove(&id) {
                let key = self.ready_key(now);
                state.ready.insert(key, entry);
            }
        }

        let due = state
            .ready
            .first_key_value()
            .filter(|((at, _), _)| *at <= now.timestamp_millis())
            .map(|(key, _)| *key);
        let Some(key) = due else {
            return Ok(None);
        };

        let Some(entry) = state.ready.remove(&key) else {
            return Ok(None);
        };
        let visibility = TimeDelta::from_std(self.visibility_timeout).unwrap_or(TimeDelta::MAX);
        let deadline = now
            .checked_add_signed(visibility)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        state.inflight.insert(entry.id, (entry.clone(), deadline));
        Ok(Some(entry))
    }

    async fn ack(&self, entry: &DispatchEntry) -> Result<(), DeliveryError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if state.inflight.remove(&entry.id).is_none() {
            state.ready.retain(|_, queued| queued.id != entry.id);
        }
        Ok(())
    }

    async fn nack(
        &self,
        entry: &DispatchEntry,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<(), DeliveryError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if let Some((entry, _)) = state.inflight.remove(&entry.id) {
            let key = self.ready_key(not_before.unwrap_or_else(Utc::now));
            state.ready.insert(key, entry);
        }
        Ok(())
    }

    async fn has_pending(&self, task_id: Uuid) -> Result<bool, DeliveryError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.ready.values().any(|e| e.task_id == task_id)
            || state.inflight.values().any(|(e, _)| e.task_id == task_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn new_task() -> NewTask {
        NewTask {
            destination: "42".to_string(),
            payload: "hi".to_string(),
            scheduled_at: None,
        }
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = InMemoryTaskStore::new();
        let task = store.insert(new_task(), Utc::now()).await.unwrap();

        let first = store.try_claim(task.id, Utc::now()).await.unwrap();
        let second = store.try_claim(task.id, Utc::now()).await.unwrap();

        let ClaimOutcome::Claimed(claim) = first else {
            panic!("first claim should succeed");
        };
        assert_eq!(claim.attempt(), 1);
        assert_eq!(second, ClaimOutcome::AlreadyInFlight);
    }

    #[tokio::test]
    async fn test_concurrent_claims_admit_one() {
        let store = Arc::new(InMemoryTaskStore::new());
        let task = store.insert(new_task(), Utc::now()).await.unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.try_claim(task.id, Utc::now()).await.unwrap() })
            })
            .collect();

        let mut claimed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                ClaimOutcome::Claimed(_) => claimed += 1,
                ClaimOutcome::AlreadyInFlight => {}
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(claimed, 1);
        assert_eq!(store.get(task.id).await.unwrap().unwrap().attempt_count, 1);
    }

    #[tokio::test]
    async fn test_scheduled_task_not_claimable_early() {
        let store = InMemoryTaskStore::new();
        let at = Utc::now() + TimeDelta::hours(1);
        let task = store
            .insert(
                NewTask {
                    scheduled_at: Some(at),
                    ..new_task()
                },
                Utc::now(),
            )
            .await
            .unwrap();

        assert_eq!(
            store.try_claim(task.id, Utc::now()).await.unwrap(),
            ClaimOutcome::NotYetDue(at)
        );
        assert!(matches!(
            store.try_claim(task.id, at).await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));
    }

    #[tokio::test]
    async fn test_record_outcome_rejects_stale_claim() {
        let store = InMemoryTaskStore::new();
        let task = store.insert(new_task(), Utc::now()).await.unwrap();
        let ClaimOutcome::Claimed(stale) = store.try_claim(task.id, Utc::now()).await.unwrap()
        else {
            panic!("claim should succeed");
        };

        let later = Utc::now() + TimeDelta::minutes(10);
        store.recover_stale(later, 5, later).await.unwrap();
        let ClaimOutcome::Claimed(fresh) = store.try_claim(task.id, later).await.unwrap() else {
            panic!("re-claim should succeed");
        };
        assert_eq!(fresh.attempt(), 2);

        let err = store
            .record_outcome(&stale, &Transition::Delivered, later)
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::InvalidTransition { .. }));

        let done = store
            .record_outcome(&fresh, &Transition::Delivered, later)
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Delivered);
    }

    #[tokio::test]
    async fn test_delete_refuses_in_flight() {
        let store = InMemoryTaskStore::new();
        let task = store.insert(new_task(), Utc::now()).await.unwrap();
        store.try_claim(task.id, Utc::now()).await.unwrap();

        assert_eq!(store.delete(task.id).await.unwrap(), DeleteOutcome::InFlight);
        assert!(store.get(task.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_queue_visibility_timeout_redelivers() {
        let queue = InMemoryQueue::new(Duration::from_millis(20));
        let task_id = Uuid::new_v4();
        queue.enqueue(task_id, None).await.unwrap();

        let first = queue.dequeue().await.unwrap().unwrap();
        assert!(queue.dequeue().await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(40)).await;
        let again = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn test_queue_ack_removes_and_nack_requeues() {
        let queue = InMemoryQueue::new(Duration::from_secs(30));
        let task_id = Uuid::new_v4();
        queue.enqueue(task_id, None).await.unwrap();

        let entry = queue.dequeue().await.unwrap().unwrap();
        queue.nack(&entry, None).await.unwrap();
        assert!(queue.has_pending(task_id).await.unwrap());

        let entry = queue.dequeue().await.unwrap().unwrap();
        queue.ack(&entry).await.unwrap();
        assert!(!queue.has_pending(task_id).await.unwrap());
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queue_holds_future_entries() {
        let queue = InMemoryQueue::new(Duration::from_secs(30));
        let task_id = Uuid::new_v4();
        queue
            .enqueue(task_id, Some(Utc::now() + TimeDelta::hours(1)))
            .await
            .unwrap();

        assert!(queue.dequeue().await.unwrap().is_none());
        assert!(queue.has_pending(task_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_queue_orders_by_not_before() {
        let queue = InMemoryQueue::new(Duration::from_secs(30));
        let late = Uuid::new_v4();
        let early = Uuid::new_v4();
        let now = Utc::now();
        queue
            .enqueue(late, Some(now - TimeDelta::seconds(1)))
            .await
            .unwrap();
        queue
            .enqueue(early, Some(now - TimeDelta::seconds(5)))
            .await
            .unwrap();

        assert_eq!(queue.dequeue().await.unwrap().unwrap().task_id, early);
        assert_eq!(queue.dequeue().await.unwrap().unwrap().task_id, late);
    }
}
