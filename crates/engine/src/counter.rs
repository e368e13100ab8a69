//! Distributed counter store: ephemeral per-task tracking state.
//!
//! Every task owns three keys: a remaining-item counter and two outcome sets
//! (succeeded / failed). They are seeded by the planner, mutated by every
//! worker handling the task and deleted once by whoever completes it.
//!
//! Each mutation is a single Redis command (`DECRBY`, `SADD`, `SET NX EX`), so
//! concurrent workers never need a read-then-write cycle.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use herald_common::error::AppError;

/// Shared, TTL-capable key/value store with atomic primitives.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Set an integer key, replacing any previous value.
    async fn set_count(&self, key: &str, value: i64) -> Result<(), AppError>;

    /// Atomically subtract `by` and return the new value. A missing key counts
    /// as zero.
    async fn decr_by(&self, key: &str, by: i64) -> Result<i64, AppError>;

    /// Add a member to a set key.
    async fn add_member(&self, key: &str, member: &str) -> Result<(), AppError>;

    /// Read every member of a set key. Missing keys read as empty.
    async fn members(&self, key: &str) -> Result<Vec<String>, AppError>;

    /// Delete keys. Missing keys are ignored.
    async fn delete(&self, keys: &[String]) -> Result<(), AppError>;

    /// Set `key` only if it does not exist, expiring after `ttl`.
    /// Returns `true` when this call created the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, AppError>;
}

/// Names of the three ephemeral keys of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskKeys {
    pub count: String,
    pub succeeded: String,
    pub failed: String,
}

impl TaskKeys {
    pub fn new(task_id: Uuid) -> Self {
        Self {
            count: format!("task:{}:count", task_id),
            succeeded: format!("task:{}:succeeded", task_id),
            failed: format!("task:{}:failed", task_id),
        }
    }

    pub fn all(&self) -> [String; 3] {
        [self.count.clone(), self.succeeded.clone(), self.failed.clone()]
    }
}

/// Redis-backed counter store.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
}

impl RedisCounterStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn set_count(&self, key: &str, value: i64) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn decr_by(&self, key: &str, by: i64) -> Result<i64, AppError> {
        let mut conn = self.conn.clone();
        let remaining: i64 = conn.decr(key, by).await?;
        Ok(remaining)
    }

    async fn add_member(&self, key: &str, member: &str) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn members(&self, key: &str) -> Result<Vec<String>, AppError> {
        let mut conn = self.conn.clone();
        let raw: redis::Value = redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await?;
        Ok(members_from_value(raw)?)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), AppError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(keys).await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, AppError> {
        let mut conn = self.conn.clone();

        // SET key value NX EX ttl
        // Returns Some("OK") if the key was created, None if it already existed
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        Ok(result.is_some())
    }
}

/// Coerce a set read into a list of members.
///
/// Depending on protocol and proxy, a set read may come back as an array, a
/// RESP3 set, a lone bulk string for a one-member set, or nil.
pub fn members_from_value(value: redis::Value) -> redis::RedisResult<Vec<String>> {
    match value {
        redis::Value::Nil => Ok(Vec::new()),
        redis::Value::Array(items) | redis::Value::Set(items) => items
            .iter()
            .map(redis::from_redis_value::<String>)
            .collect(),
        scalar => Ok(vec![redis::from_redis_value::<String>(&scalar)?]),
    }
}
