//! Durable message broker.
//!
//! Topology (names come from [`BrokerTopology`]):
//! - live queue: consumed by delivery workers
//! - deferred queue: holds items published with a TTL; an expired item is
//!   dead-lettered into the live queue with its original routing key
//! - dead-letter queue: items rejected without requeue
//! - callback-retry exchange: fan-out of completion summaries whose callback
//!   could not be delivered
//!
//! The Redis adapter keeps each queue as a list (the deferred queue as a sorted
//! set scored by expiry). Expired deferred items are moved by an atomic script
//! at the head of every receive, the same way a broker expires messages when
//! they reach the queue head, so no separate timer process exists.
//!
//! A received message moves into its consumer's in-flight list, and a lease
//! scored by receive time is recorded in the same script. Leases older than
//! the visibility timeout are requeued by [`MessageBroker::requeue_expired`],
//! whichever consumer held them, so a consumer that never comes back under
//! the same name does not strand its messages.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use herald_common::config::BrokerTopology;
use herald_common::error::AppError;

/// Upper bound on how many expired deferred items one receive promotes.
const PROMOTE_BATCH: usize = 100;

/// How long an idle consumer sleeps between empty reads.
const IDLE_STEP: Duration = Duration::from_millis(100);

/// Moves every deferred member whose expiry score is due into the live list.
const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, member in ipairs(due) do
    redis.call('ZREM', KEYS[1], member)
    redis.call('LPUSH', KEYS[2], member)
end
return #due
"#;

/// Pops the next live message into the consumer's in-flight list and leases it.
const RECEIVE_SCRIPT: &str = r#"
local raw = redis.call('RPOPLPUSH', KEYS[1], KEYS[2])
if raw then
    redis.call('ZADD', KEYS[3], ARGV[1], KEYS[2] .. '\n' .. raw)
end
return raw
"#;

/// Returns every message whose lease is older than the cutoff to the live list.
/// A lease is `<in-flight list>\n<raw message>`; one whose message was already
/// settled is just dropped.
const REAP_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
local moved = 0
for _, lease in ipairs(expired) do
    redis.call('ZREM', KEYS[1], lease)
    local sep = string.find(lease, '\n', 1, true)
    if sep then
        local list = string.sub(lease, 1, sep - 1)
        local raw = string.sub(lease, sep + 1)
        if redis.call('LREM', list, 1, raw) > 0 then
            redis.call('LPUSH', KEYS[2], raw)
            moved = moved + 1
        end
    end
end
return moved
"#;

/// A message as stored on a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub routing_key: String,
    pub body: String,
    pub published_at_ms: i64,
    /// Set when the message was dead-lettered after a rejection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
}

impl Envelope {
    pub fn new(routing_key: &str, body: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            routing_key: routing_key.to_string(),
            body: body.to_string(),
            published_at_ms: Utc::now().timestamp_millis(),
            reject_reason: None,
        }
    }
}

/// A message handed to a consumer, pending ack or reject.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: Envelope,
    /// Exact stored form, used to remove the message from the in-flight list
    pub raw: String,
}

impl Delivery {
    pub fn body(&self) -> &str {
        &self.envelope.body
    }

    pub fn routing_key(&self) -> &str {
        &self.envelope.routing_key
    }
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publish to the live delivery queue.
    async fn publish(&self, routing_key: &str, body: &str) -> Result<(), AppError>;

    /// Publish to the deferred queue. After `ttl` the message is dead-lettered
    /// into the live queue under the same routing key.
    async fn publish_deferred(
        &self,
        routing_key: &str,
        body: &str,
        ttl: Duration,
    ) -> Result<(), AppError>;

    /// Publish a completion summary to the callback-retry exchange.
    async fn publish_callback_retry(&self, body: &str) -> Result<(), AppError>;

    /// Wait up to `timeout` for the next live message.
    async fn receive(&self, timeout: Duration) -> Result<Option<Delivery>, AppError>;

    /// Remove a received message for good.
    async fn ack(&self, delivery: &Delivery) -> Result<(), AppError>;

    /// Reject without requeue: the message moves to the dead-letter queue.
    async fn reject(&self, delivery: &Delivery, reason: &str) -> Result<(), AppError>;

    /// Return every message received more than `older_than` ago and still
    /// unsettled, by any consumer, to the live queue. Returns how many moved.
    async fn requeue_expired(&self, older_than: Duration) -> Result<usize, AppError>;
}

/// Redis-backed broker. Each consumer owns an in-flight list, so a message a
/// crashed consumer never acknowledged is returned by [`recover_in_flight`].
///
/// [`recover_in_flight`]: RedisBroker::recover_in_flight
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
    topology: BrokerTopology,
    consumer: String,
}

impl RedisBroker {
    pub fn new(conn: ConnectionManager, topology: BrokerTopology) -> Self {
        Self {
            conn,
            topology,
            consumer: "default".to_string(),
        }
    }

    /// A handle that consumes under its own in-flight list.
    pub fn consumer(&self, name: impl Into<String>) -> Self {
        Self {
            conn: self.conn.clone(),
            topology: self.topology.clone(),
            consumer: name.into(),
        }
    }

    fn queue_key(name: &str) -> String {
        format!("herald:queue:{}", name)
    }

    fn live_key(&self) -> String {
        Self::queue_key(&self.topology.live_queue)
    }

    fn deferred_key(&self) -> String {
        Self::queue_key(&self.topology.deferred_queue)
    }

    fn dead_letter_key(&self) -> String {
        Self::queue_key(&self.topology.dead_letter_queue)
    }

    fn callback_retry_key(&self) -> String {
        format!("herald:exchange:{}", self.topology.callback_retry_exchange)
    }

    fn in_flight_key(&self) -> String {
        format!("{}:in_flight:{}", self.live_key(), self.consumer)
    }

    fn lease_key(&self) -> String {
        format!("{}:leases", self.live_key())
    }

    fn lease_member(&self, raw: &str) -> String {
        format!("{}\n{}", self.in_flight_key(), raw)
    }

    /// Move expired deferred items into the live queue. Returns how many moved.
    pub async fn promote_due(&self) -> Result<usize, AppError> {
        let mut conn = self.conn.clone();
        let moved: usize = redis::Script::new(PROMOTE_SCRIPT)
            .key(self.deferred_key())
            .key(self.live_key())
            .arg(Utc::now().timestamp_millis())
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await?;

        if moved > 0 {
            tracing::debug!(moved, "Deferred items expired into live queue");
        }
        Ok(moved)
    }

    /// Return messages this consumer received but never settled to the live
    /// queue. Call once before consuming.
    pub async fn recover_in_flight(&self) -> Result<usize, AppError> {
        let mut conn = self.conn.clone();
        let mut recovered = 0;
        loop {
            let moved: Option<String> = conn.rpoplpush(self.in_flight_key(), self.live_key()).await?;
            let Some(raw) = moved else {
                break;
            };
            conn.zrem::<_, _, ()>(self.lease_key(), self.lease_member(&raw)).await?;
            recovered += 1;
        }

        if recovered > 0 {
            tracing::warn!(consumer = %self.consumer, recovered, "Requeued unacknowledged messages");
        }
        Ok(recovered)
    }

    /// Time until the earliest deferred item expires, if any.
    async fn next_due_in(&self) -> Result<Option<Duration>, AppError> {
        let mut conn = self.conn.clone();
        let head: Vec<(String, f64)> = conn.zrange_withscores(self.deferred_key(), 0, 0).await?;
        Ok(head.first().map(|(_, score)| {
            let wait = (*score as i64 - Utc::now().timestamp_millis()).max(0);
            Duration::from_millis(wait as u64)
        }))
    }

    async fn push_envelope(&self, key: String, envelope: &Envelope) -> Result<(), AppError> {
        let raw = serde_json::to_string(envelope)?;
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(key, raw).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageBroker for RedisBroker {
    async fn publish(&self, routing_key: &str, body: &str) -> Result<(), AppError> {
        self.push_envelope(self.live_key(), &Envelope::new(routing_key, body))
            .await
    }

    async fn publish_deferred(
        &self,
        routing_key: &str,
        body: &str,
        ttl: Duration,
    ) -> Result<(), AppError> {
        let envelope = Envelope::new(routing_key, body);
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = envelope.published_at_ms.saturating_add(ttl_ms);
        let raw = serde_json::to_string(&envelope)?;

        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(self.deferred_key(), raw, expires_at).await?;
        Ok(())
    }

    async fn publish_callback_retry(&self, body: &str) -> Result<(), AppError> {
        self.push_envelope(self.callback_retry_key(), &Envelope::new("", body))
            .await
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Delivery>, AppError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.promote_due().await?;

            let mut conn = self.conn.clone();
            let raw: Option<String> = redis::Script::new(RECEIVE_SCRIPT)
                .key(self.live_key())
                .key(self.in_flight_key())
                .key(self.lease_key())
                .arg(Utc::now().timestamp_millis())
                .invoke_async(&mut conn)
                .await?;
            if let Some(raw) = raw {
                return match serde_json::from_str::<Envelope>(&raw) {
                    Ok(envelope) => Ok(Some(Delivery { envelope, raw })),
                    // Not an envelope at all: hand the raw text to the
                    // consumer, which will reject it.
                    Err(_) => Ok(Some(Delivery {
                        envelope: Envelope::new("", &raw),
                        raw,
                    })),
                };
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let mut step = IDLE_STEP.min(deadline - now);
            if let Some(due) = self.next_due_in().await? {
                step = step.min(due);
            }
            tokio::time::sleep(step).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .lrem(self.in_flight_key(), 1, &delivery.raw)
            .ignore()
            .zrem(self.lease_key(), self.lease_member(&delivery.raw))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery, reason: &str) -> Result<(), AppError> {
        let mut dead = delivery.envelope.clone();
        dead.reject_reason = Some(reason.to_string());
        let dead_raw = serde_json::to_string(&dead)?;

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .lrem(self.in_flight_key(), 1, &delivery.raw)
            .ignore()
            .zrem(self.lease_key(), self.lease_member(&delivery.raw))
            .ignore()
            .lpush(self.dead_letter_key(), dead_raw)
            .ignore()
            .query_async(&mut conn)
            .await?;

        tracing::warn!(message_id = %delivery.envelope.id, reason, "Message dead-lettered");
        Ok(())
    }

    async fn requeue_expired(&self, older_than: Duration) -> Result<usize, AppError> {
        let older_ms = i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp_millis().saturating_sub(older_ms);

        let mut conn = self.conn.clone();
        let moved: usize = redis::Script::new(REAP_SCRIPT)
            .key(self.lease_key())
            .key(self.live_key())
            .arg(cutoff)
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await?;

        if moved > 0 {
            tracing::warn!(moved, "Requeued expired in-flight messages");
        }
        Ok(moved)
    }
}
