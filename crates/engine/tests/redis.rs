//! Integration tests for the Redis broker and counter store.
//!
//! Requires a running Redis with `REDIS_URL` env var set (defaults to
//! localhost). Every test uses its own queue names and keys. Run with:
//!
//! ```bash
//! REDIS_URL="redis://localhost:6379" \
//!   cargo test -p herald-engine --test redis -- --ignored --nocapture
//! ```

use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use herald_common::config::BrokerTopology;
use herald_common::redis_pool::create_redis_pool;
use herald_engine::broker::{Envelope, MessageBroker, RedisBroker};
use herald_engine::counter::{CounterStore, RedisCounterStore};

// ============================================================
// Shared helpers
// ============================================================

async fn connect() -> ConnectionManager {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    create_redis_pool(&url).await.unwrap()
}

fn topology() -> BrokerTopology {
    let run = Uuid::new_v4().simple().to_string();
    BrokerTopology {
        live_queue: format!("test_live_{}", run),
        deferred_queue: format!("test_deferred_{}", run),
        dead_letter_queue: format!("test_dead_{}", run),
        callback_retry_exchange: format!("test_callback_{}", run),
        routing_key: "notification/template".to_string(),
    }
}

async fn cleanup(conn: &mut ConnectionManager, topology: &BrokerTopology) {
    let pattern = format!("herald:*{}*", topology.live_queue.trim_start_matches("test_live_"));
    let keys: Vec<String> = conn.keys(pattern).await.unwrap();
    if !keys.is_empty() {
        conn.del::<_, ()>(keys).await.unwrap();
    }
}

// ============================================================
// Broker
// ============================================================

#[tokio::test]
#[ignore]
async fn test_deferred_message_is_promoted_after_ttl() {
    let mut conn = connect().await;
    let topology = topology();
    let broker = RedisBroker::new(conn.clone(), topology.clone()).consumer("c1");

    broker
        .publish_deferred(&topology.routing_key, "later", Duration::from_millis(400))
        .await
        .unwrap();

    let early = broker.receive(Duration::from_millis(50)).await.unwrap();
    assert!(early.is_none(), "deferred message delivered before its TTL");

    let delivery = broker.receive(Duration::from_secs(3)).await.unwrap().unwrap();
    assert_eq!(delivery.body(), "later");
    assert_eq!(delivery.routing_key(), topology.routing_key);
    broker.ack(&delivery).await.unwrap();

    let in_flight: usize = conn
        .llen(format!("herald:queue:{}:in_flight:c1", topology.live_queue))
        .await
        .unwrap();
    assert_eq!(in_flight, 0);

    cleanup(&mut conn, &topology).await;
}

#[tokio::test]
#[ignore]
async fn test_far_future_deferral_stays_deferred() {
    let mut conn = connect().await;
    let topology = topology();
    let broker = RedisBroker::new(conn.clone(), topology.clone());

    broker
        .publish_deferred(&topology.routing_key, "never", Duration::MAX)
        .await
        .unwrap();
    assert!(broker.receive(Duration::from_millis(50)).await.unwrap().is_none());

    cleanup(&mut conn, &topology).await;
}

#[tokio::test]
#[ignore]
async fn test_restarted_consumer_recovers_its_in_flight() {
    let mut conn = connect().await;
    let topology = topology();
    let broker = RedisBroker::new(conn.clone(), topology.clone());

    broker.publish(&topology.routing_key, "item").await.unwrap();
    let first = broker
        .consumer("worker-0")
        .receive(Duration::from_millis(200))
        .await
        .unwrap()
        .unwrap();

    // same name after a restart
    let restarted = broker.consumer("worker-0");
    assert_eq!(restarted.recover_in_flight().await.unwrap(), 1);

    let again = restarted.receive(Duration::from_millis(200)).await.unwrap().unwrap();
    assert_eq!(again.envelope.id, first.envelope.id);
    restarted.ack(&again).await.unwrap();
    assert_eq!(restarted.recover_in_flight().await.unwrap(), 0);

    cleanup(&mut conn, &topology).await;
}

#[tokio::test]
#[ignore]
async fn test_expired_lease_is_requeued_for_another_consumer() {
    let mut conn = connect().await;
    let topology = topology();
    let broker = RedisBroker::new(conn.clone(), topology.clone());

    broker.publish(&topology.routing_key, "orphan").await.unwrap();
    broker.publish(&topology.routing_key, "settled").await.unwrap();
    let gone = broker.consumer("old-host-3");
    let orphan = gone.receive(Duration::from_millis(200)).await.unwrap().unwrap();
    let settled = gone.receive(Duration::from_millis(200)).await.unwrap().unwrap();
    gone.ack(&settled).await.unwrap();

    assert_eq!(broker.requeue_expired(Duration::from_secs(60)).await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(broker.requeue_expired(Duration::from_secs(1)).await.unwrap(), 1);

    let other = broker.consumer("new-host-0");
    let delivery = other.receive(Duration::from_millis(200)).await.unwrap().unwrap();
    assert_eq!(delivery.envelope.id, orphan.envelope.id);
    other.ack(&delivery).await.unwrap();

    let leases: usize = conn
        .zcard(format!("herald:queue:{}:leases", topology.live_queue))
        .await
        .unwrap();
    assert_eq!(leases, 0);

    cleanup(&mut conn, &topology).await;
}

#[tokio::test]
#[ignore]
async fn test_reject_moves_message_to_dead_letter_list() {
    let mut conn = connect().await;
    let topology = topology();
    let broker = RedisBroker::new(conn.clone(), topology.clone()).consumer("c1");

    broker.publish(&topology.routing_key, "not json").await.unwrap();
    let delivery = broker.receive(Duration::from_millis(200)).await.unwrap().unwrap();
    broker.reject(&delivery, "parse error").await.unwrap();

    let dead: Vec<String> = conn
        .lrange(format!("herald:queue:{}", topology.dead_letter_queue), 0, -1)
        .await
        .unwrap();
    assert_eq!(dead.len(), 1);
    let envelope: Envelope = serde_json::from_str(&dead[0]).unwrap();
    assert_eq!(envelope.id, delivery.envelope.id);
    assert_eq!(envelope.reject_reason.as_deref(), Some("parse error"));

    let in_flight: usize = conn
        .llen(format!("herald:queue:{}:in_flight:c1", topology.live_queue))
        .await
        .unwrap();
    assert_eq!(in_flight, 0);
    assert_eq!(broker.requeue_expired(Duration::ZERO).await.unwrap(), 0);

    cleanup(&mut conn, &topology).await;
}

// ============================================================
// Counter store
// ============================================================

#[tokio::test]
#[ignore]
async fn test_set_if_absent_is_exclusive_until_expiry() {
    let mut conn = connect().await;
    let counter = RedisCounterStore::new(conn.clone());
    let key = format!("herald:test:lock:{}", Uuid::new_v4());

    assert!(counter.set_if_absent(&key, "a", Duration::from_secs(1)).await.unwrap());
    assert!(!counter.set_if_absent(&key, "b", Duration::from_secs(1)).await.unwrap());

    let ttl: i64 = conn.ttl(&key).await.unwrap();
    assert!(ttl > 0, "lock must carry a TTL");

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(counter.set_if_absent(&key, "c", Duration::from_secs(1)).await.unwrap());

    conn.del::<_, ()>(&key).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_counter_and_sets_against_real_replies() {
    let mut conn = connect().await;
    let counter = RedisCounterStore::new(conn.clone());
    let run = Uuid::new_v4();
    let count = format!("herald:test:count:{}", run);
    let set = format!("herald:test:set:{}", run);

    counter.set_count(&count, 2).await.unwrap();
    assert_eq!(counter.decr_by(&count, 1).await.unwrap(), 1);
    assert_eq!(counter.decr_by(&count, 1).await.unwrap(), 0);

    assert!(counter.members(&set).await.unwrap().is_empty());
    counter.add_member(&set, "only").await.unwrap();
    assert_eq!(counter.members(&set).await.unwrap(), vec!["only"]);
    counter.add_member(&set, "only").await.unwrap();
    counter.add_member(&set, "second").await.unwrap();
    assert_eq!(counter.members(&set).await.unwrap().len(), 2);

    counter.delete(&[count.clone(), set.clone()]).await.unwrap();
    // a missing count decrements from zero
    assert_eq!(counter.decr_by(&count, 1).await.unwrap(), -1);

    conn.del::<_, ()>(vec![count, set]).await.unwrap();
}
