//! Dispatch queue boundary.
//!
//! At-least-once, best-effort FIFO by `not_before`. An entry handed out by
//! `dequeue` stays invisible until it is acked, nacked, or its visibility
//! timeout lapses, after which it is handed out again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DeliveryError;

/// A queue message pointing at a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DispatchEntry {
    pub id: Uuid,
    pub task_id: Uuid,
}

impl DispatchEntry {
    pub fn new(task_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
        }
    }
}

#[async_trait]
pub trait DispatchQueue: Send + Sync {
    /// Add an entry for `task_id`, deliverable from `not_before` on
    /// (immediately when `None`).
    async fn enqueue(
        &self,
        task_id: Uuid,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<DispatchEntry, DeliveryError>;

    /// Take the oldest deliverable entry, if any. Does not block.
    async fn dequeue(&self) -> Result<Option<DispatchEntry>, DeliveryError>;

    /// Drop a delivered entry for good.
    async fn ack(&self, entry: &DispatchEntry) -> Result<(), DeliveryError>;

    /// Hand an entry back for redelivery from `not_before` on.
    async fn nack(
        &self,
        entry: &DispatchEntry,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<(), DeliveryError>;

    /// Whether any entry for `task_id` is waiting or in flight.
    async fn has_pending(&self, task_id: Uuid) -> Result<bool, DeliveryError>;
}
