//! Redis-backed dispatch queue.
//!
//! Layout under `prefix`:
//! - `{prefix}:ready`    sorted set, member = entry JSON, score = not-before (ms)
//! - `{prefix}:inflight` sorted set, member = entry JSON, score = visibility deadline (ms)
//! - `{prefix}:tasks`    hash, task id -> number of ready + in-flight entries
//!
//! Every operation is a single Lua script, so moves between the sets are atomic.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Script};
use redis::aio::ConnectionManager;
use uuid::Uuid;

use crate::error::DeliveryError;
use crate::queue::{DispatchEntry, DispatchQueue};

const ENQUEUE: &str = r#"
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
redis.call('HINCRBY', KEYS[2], ARGV[3], 1)
return 1
"#;

// Expired in-flight entries go back to ready before picking the next one.
const DEQUEUE: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, member in ipairs(expired) do
  redis.call('ZREM', KEYS[2], member)
  redis.call('ZADD', KEYS[1], ARGV[1], member)
end
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #due == 0 then
  return false
end
redis.call('ZREM', KEYS[1], due[1])
redis.call('ZADD', KEYS[2], ARGV[2], due[1])
return due[1]
"#;

// A lapsed entry may already sit in ready again; drop it there as well.
const ACK: &str = r#"
local removed = redis.call('ZREM', KEYS[1], ARGV[1]) + redis.call('ZREM', KEYS[3], ARGV[1])
if removed > 0 then
  local left = redis.call('HINCRBY', KEYS[2], ARGV[2], -1)
  if left <= 0 then
    redis.call('HDEL', KEYS[2], ARGV[2])
  end
  return 1
end
return 0
"#;

const NACK: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
  redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
  return 1
end
return 0
"#;

// Drops an unreadable in-flight member. ARGV[2] is the task id when it could
// be salvaged from the member, empty otherwise.
const DROP: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
if ARGV[2] ~= '' then
  local left = redis.call('HINCRBY', KEYS[2], ARGV[2], -1)
  if left <= 0 then
    redis.call('HDEL', KEYS[2], ARGV[2])
  end
end
return 1
"#;

#[derive(Clone)]
pub struct RedisDispatchQueue {
    redis: ConnectionManager,
    ready_key: String,
    inflight_key: String,
    tasks_key: String,
    visibility_timeout: Duration,
}

impl RedisDispatchQueue {
    pub fn new(redis: ConnectionManager, prefix: &str, visibility_timeout: Duration) -> Self {
        Self {
            redis,
            ready_key: format!("{}:ready", prefix),
            inflight_key: format!("{}:inflight", prefix),
            tasks_key: format!("{}:tasks", prefix),
            visibility_timeout,
        }
    }

    fn encode(entry: &DispatchEntry) -> Result<String, DeliveryError> {
        serde_json::to_string(entry)
            .map_err(|e| DeliveryError::QueueUnavailable(format!("encode entry: {}", e)))
    }

    fn score(at: Option<DateTime<Utc>>) -> i64 {
        at.unwrap_or_else(Utc::now).timestamp_millis()
    }

    /// Remove a malformed member from the in-flight set, keeping the
    /// per-task counter in step when the task id is still readable.
    async fn drop_malformed(&self, member: &str) -> Result<(), DeliveryError> {
        let task_id = salvage_task_id(member);
        let mut redis = self.redis.clone();

        let _: i64 = Script::new(DROP)
            .key(&self.inflight_key)
            .key(&self.tasks_key)
            .arg(member)
            .arg(task_id.map(|id| id.to_string()).unwrap_or_default())
            .invoke_async(&mut redis)
            .await?;

        if task_id.is_none() {
            // The owning task's count stays raised, so has_pending keeps
            // reporting it queued and the sweeper skips it.
            tracing::warn!(
                member = %member,
                tasks_key = %self.tasks_key,
                "Dropped entry has no readable task_id; pending counter left unchanged"
            );
        }
        Ok(())
    }
}

/// Best-effort read of `task_id` from a member that failed to decode.
fn salvage_task_id(member: &str) -> Option<Uuid> {
    serde_json::from_str::<serde_json::Value>(member)
        .ok()?
        .get("task_id")?
        .as_str()?
        .parse()
        .ok()
}

#[async_trait]
impl DispatchQueue for RedisDispatchQueue {
    async fn enqueue(
        &self,
        task_id: Uuid,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<DispatchEntry, DeliveryError> {
        let entry = DispatchEntry::new(task_id);
        let mut redis = self.redis.clone();

        let _: i64 = Script::new(ENQUEUE)
            .key(&self.ready_key)
            .key(&self.tasks_key)
            .arg(Self::encode(&entry)?)
            .arg(Self::score(not_before))
            .arg(task_id.to_string())
            .invoke_async(&mut redis)
            .await?;

        tracing::debug!(task_id = %task_id, entry_id = %entry.id, "Dispatch entry enqueued");
        Ok(entry)
    }

    async fn dequeue(&self) -> Result<Option<DispatchEntry>, DeliveryError> {
        let now = Utc::now().timestamp_millis();
        let deadline = now + self.visibility_timeout.as_millis() as i64;
        let mut redis = self.redis.clone();

        let member: Option<String> = Script::new(DEQUEUE)
            .key(&self.ready_key)
            .key(&self.inflight_key)
            .arg(now)
            .arg(deadline)
            .invoke_async(&mut redis)
            .await?;

        let Some(member) = member else {
            return Ok(None);
        };

        match serde_json::from_str::<DispatchEntry>(&member) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                // Unreadable members would be redelivered forever; drop them.
                tracing::error!(member = %member, error = %e, "Dropping malformed dispatch entry");
                self.drop_malformed(&member).await?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, entry: &DispatchEntry) -> Result<(), DeliveryError> {
        let mut redis = self.redis.clone();

        let removed: i64 = Script::new(ACK)
            .key(&self.inflight_key)
            .key(&self.tasks_key)
            .key(&self.ready_key)
            .arg(Self::encode(entry)?)
            .arg(entry.task_id.to_string())
            .invoke_async(&mut redis)
            .await?;

        if removed == 0 {
            tracing::debug!(
                entry_id = %entry.id,
                "Ack for entry no longer queued (already acked by a redelivery)"
            );
        }
        Ok(())
    }

    async fn nack(
        &self,
        entry: &DispatchEntry,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<(), DeliveryError> {
        let mut redis = self.redis.clone();

        let _: i64 = Script::new(NACK)
            .key(&self.inflight_key)
            .key(&self.ready_key)
            .arg(Self::encode(entry)?)
            .arg(Self::score(not_before))
            .invoke_async(&mut redis)
            .await?;

        Ok(())
    }

    async fn has_pending(&self, task_id: Uuid) -> Result<bool, DeliveryError> {
        let mut redis = self.redis.clone();
        let count: Option<i64> = redis.hget(&self.tasks_key, task_id.to_string()).await?;
        Ok(count.unwrap_or(0) > 0)
    }
}
