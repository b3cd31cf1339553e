//! Delivery worker loop.
//!
//! One entry at a time: dequeue → claim → send (bounded) → record → ack.
//! The queue entry is acknowledged only after the store accepted the
//! outcome; a failed write leaves it in flight so the queue redelivers it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::watch;

use herald_common::config::AppConfig;
use herald_engine::machine::{self, SendOutcome, Transition};
use herald_engine::{ClaimOutcome, DeliveryError, DispatchEntry, DispatchQueue, RetryPolicy, TaskStore};

use crate::sender::MessageSender;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerSettings {
    /// Upper bound on one sender call; exceeding it is a retryable failure.
    pub send_timeout: Duration,
    /// Sleep between polls while the queue is empty.
    pub poll_interval: Duration,
    /// Delay before an entry is redelivered after the store was unreachable.
    pub storage_backoff: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            send_timeout: Duration::from_millis(config.send_timeout_ms),
            poll_interval: Duration::from_millis(config.worker_poll_interval_ms),
            storage_backoff: Duration::from_millis(config.storage_backoff_ms),
        }
    }
}

/// What happened to one dequeued entry.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    Delivered,
    RetryScheduled { next_attempt_at: DateTime<Utc> },
    FailedPermanently,
    /// Duplicate or obsolete entry, acked without sending.
    Discarded(&'static str),
    /// Task not claimable yet; entry handed back until then.
    Deferred { until: DateTime<Utc> },
    /// The outcome could not be persisted; the entry stays in flight.
    Unacknowledged,
}

pub struct DeliveryWorker {
    id: usize,
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn DispatchQueue>,
    sender: Arc<dyn MessageSender>,
    policy: RetryPolicy,
    settings: WorkerSettings,
}

impl DeliveryWorker {
    pub fn new(
        id: usize,
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn DispatchQueue>,
        sender: Arc<dyn MessageSender>,
        policy: RetryPolicy,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            id,
            store,
            queue,
            sender,
            policy,
            settings,
        }
    }

    /// Consume the queue until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker = self.id, "Delivery worker started");

        while !*shutdown.borrow() {
            let idle = match self.poll_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    tracing::warn!(worker = self.id, error = %e, "Delivery poll failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        tracing::info!(worker = self.id, "Delivery worker stopped");
    }

    /// Process at most one entry. `Ok(None)` means the queue had nothing due.
    pub async fn poll_once(&self) -> Result<Option<EntryOutcome>, DeliveryError> {
        let Some(entry) = self.queue.dequeue().await? else {
            return Ok(None);
        };
        self.process(&entry).await.map(Some)
    }

    async fn process(&self, entry: &DispatchEntry) -> Result<EntryOutcome, DeliveryError> {
        let now = Utc::now();

        let claim = match self.store.try_claim(entry.task_id, now).await {
            Ok(ClaimOutcome::Claimed(claim)) => claim,
            Ok(ClaimOutcome::NotYetDue(until)) => {
                self.queue.nack(entry, Some(until)).await?;
                return Ok(EntryOutcome::Deferred { until });
            }
            Ok(other) => {
                tracing::debug!(
                    worker = self.id,
                    task_id = %entry.task_id,
                    entry_id = %entry.id,
                    reason = other.label(),
                    "Discarding duplicate dispatch entry"
                );
                self.queue.ack(entry).await?;
                return Ok(EntryOutcome::Discarded(other.label()));
            }
            Err(e) => {
                let retry_at = now
                    .checked_add_signed(to_delta(self.settings.storage_backoff))
                    .unwrap_or(now);
                if let Err(nack_err) = self.queue.nack(entry, Some(retry_at)).await {
                    tracing::warn!(entry_id = %entry.id, error = %nack_err, "Nack failed");
                }
                return Err(e);
            }
        };

        let task = &claim.task;
        tracing::info!(
            worker = self.id,
            task_id = %task.id,
            attempt = claim.attempt(),
            "Delivering notification"
        );

        let outcome = match tokio::time::timeout(
            self.settings.send_timeout,
            self.sender.send(&task.destination, &task.payload),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => SendOutcome::RetryableFailure(format!(
                "send timed out after {} ms",
                self.settings.send_timeout.as_millis()
            )),
        };

        let now = Utc::now();
        let transition = machine::decide(outcome, claim.attempt(), &self.policy, now);

        match self.store.record_outcome(&claim, &transition, now).await {
            Ok(_) => {}
            Err(DeliveryError::StorageUnavailable(msg)) => {
                tracing::error!(
                    worker = self.id,
                    task_id = %task.id,
                    error = %msg,
                    "Could not record delivery outcome; leaving entry for redelivery"
                );
                return Ok(EntryOutcome::Unacknowledged);
            }
            Err(e) => {
                tracing::warn!(
                    worker = self.id,
                    task_id = %task.id,
                    attempt = claim.attempt(),
                    error = %e,
                    "Delivery outcome rejected; claim no longer held"
                );
                self.queue.ack(entry).await?;
                return Ok(EntryOutcome::Discarded("stale_claim"));
            }
        }

        let result = match &transition {
            Transition::Delivered => {
                tracing::info!(task_id = %task.id, attempt = claim.attempt(), "Notification delivered");
                EntryOutcome::Delivered
            }
            Transition::Retry {
                next_attempt_at,
                error,
            } => {
                tracing::warn!(
                    task_id = %task.id,
                    attempt = claim.attempt(),
                    next_attempt_at = %next_attempt_at,
                    error = %error,
                    "Delivery failed, retry scheduled"
                );
                if let Err(e) = self.queue.enqueue(task.id, Some(*next_attempt_at)).await {
                    // The sweeper re-enqueues due retries that have no entry.
                    tracing::warn!(task_id = %task.id, error = %e, "Could not enqueue retry");
                }
                EntryOutcome::RetryScheduled {
                    next_attempt_at: *next_attempt_at,
                }
            }
            Transition::Fail { error } => {
                tracing::error!(
                    task_id = %task.id,
                    attempt = claim.attempt(),
                    error = %error,
                    "Delivery failed permanently"
                );
                EntryOutcome::FailedPermanently
            }
        };

        self.queue.ack(entry).await?;
        Ok(result)
    }
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}
