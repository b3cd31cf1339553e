//! Recovery sweeper: self-healing for lost queue entries and dead workers.
//!
//! Each sweep:
//! 1. Reclaims `in_flight` tasks whose claim is older than the staleness
//!    threshold (worker crashed before recording the attempt).
//! 2. Re-enqueues due `failed_retryable` tasks that have no dispatch entry.
//! 3. Re-enqueues old `pending` tasks that have no dispatch entry.
//!
//! The sweeper keeps no state of its own; duplicate entries it may create are
//! rejected by the claim guard.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::watch;

use herald_common::config::AppConfig;
use herald_common::types::TaskStatus;

use crate::error::DeliveryError;
use crate::queue::DispatchQueue;
use crate::store::TaskStore;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepSettings {
    pub interval: Duration,
    pub claim_staleness: Duration,
    pub orphan_grace: Duration,
    pub max_attempts: i32,
    /// Upper bound on tasks fetched per step.
    pub batch_size: i64,
}

impl SweepSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.sweep_interval_secs),
            claim_staleness: Duration::from_secs(config.claim_staleness_secs),
            orphan_grace: Duration::from_secs(config.orphan_grace_secs),
            max_attempts: config.retry_max_attempts,
            batch_size: config.sweep_batch_size,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stale claims forced out of `in_flight`.
    pub recovered: usize,
    /// Due retries that had lost their dispatch entry.
    pub requeued_retries: usize,
    /// Pending tasks that had lost their dispatch entry.
    pub requeued_pending: usize,
}

pub struct RecoverySweeper {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn DispatchQueue>,
    settings: SweepSettings,
}

impl RecoverySweeper {
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn DispatchQueue>,
        settings: SweepSettings,
    ) -> Self {
        Self {
            store,
            queue,
            settings,
        }
    }

    /// Sweep every `interval` until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.settings.interval.as_secs(),
            claim_staleness_secs = self.settings.claim_staleness.as_secs(),
            "Recovery sweeper started"
        );

        loop {
            match self.sweep_once(Utc::now()).await {
                Ok(report) if report != SweepReport::default() => {
                    tracing::info!(
                        recovered = report.recovered,
                        requeued_retries = report.requeued_retries,
                        requeued_pending = report.requeued_pending,
                        "Recovery sweep repaired tasks"
                    );
                }
                Ok(_) => tracing::debug!("Recovery sweep found nothing to do"),
                Err(e) => tracing::warn!(error = %e, "Recovery sweep failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.interval) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
        }

        tracing::info!("Recovery sweeper stopped");
    }

    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, DeliveryError> {
        let mut report = SweepReport::default();

        let stale_before = earlier(now, self.settings.claim_staleness);
        let recovered = self
            .store
            .recover_stale(stale_before, self.settings.max_attempts, now)
            .await?;
        for task in &recovered {
            report.recovered += 1;
            if task.status == TaskStatus::FailedRetryable {
                self.queue.enqueue(task.id, task.next_attempt_at).await?;
            }
            tracing::warn!(
                task_id = %task.id,
                attempt = task.attempt_count,
                status = %task.status,
                "Recovered stale claim"
            );
        }

        for task in self.store.due_retries(now, self.settings.batch_size).await? {
            if self.queue.has_pending(task.id).await? {
                continue;
            }
            self.queue.enqueue(task.id, None).await?;
            report.requeued_retries += 1;
            tracing::info!(task_id = %task.id, attempt = task.attempt_count, "Re-enqueued lost retry");
        }

        let created_before = earlier(now, self.settings.orphan_grace);
        for task in self
            .store
            .stale_pending(created_before, self.settings.batch_size)
            .await?
        {
            if self.queue.has_pending(task.id).await? {
                continue;
            }
            self.queue.enqueue(task.id, task.scheduled_at).await?;
            report.requeued_pending += 1;
            tracing::info!(task_id = %task.id, "Re-enqueued orphaned pending task");
        }

        Ok(report)
    }
}

fn earlier(now: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(by)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
