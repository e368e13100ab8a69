//! In-process adapters for the counter store, broker and persistent store.
//!
//! They follow the same contracts as the Redis and Postgres adapters, which
//! makes them suitable for tests and single-process development runs. Timing
//! uses `tokio::time`, so tests can run on a paused clock.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{
    Account, ItemRecord, PushStatus, TaskProgress, TaskRecord, TemplateSetting,
};

use crate::broker::{Delivery, Envelope, MessageBroker};
use crate::counter::CounterStore;
use crate::store::{DispatchStore, NewTask};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================
// Counter store
// ============================================================

#[derive(Debug, Clone)]
enum Slot {
    Int(i64),
    Set(BTreeSet<String>),
    Text(String),
}

#[derive(Debug, Clone)]
struct Cell {
    slot: Slot,
    expires_at: Option<Instant>,
}

/// In-memory counter store with per-key expiry.
#[derive(Default)]
pub struct MemoryCounterStore {
    cells: Mutex<HashMap<String, Cell>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live<'a>(cells: &'a mut HashMap<String, Cell>, key: &str) -> Option<&'a mut Cell> {
        let expired = cells
            .get(key)
            .and_then(|c| c.expires_at)
            .is_some_and(|at| at <= Instant::now());
        if expired {
            cells.remove(key);
        }
        cells.get_mut(key)
    }

    pub fn exists(&self, key: &str) -> bool {
        let mut cells = lock(&self.cells);
        Self::live(&mut cells, key).is_some()
    }

    /// Current integer value of `key`, if it holds one.
    pub fn count(&self, key: &str) -> Option<i64> {
        let mut cells = lock(&self.cells);
        match Self::live(&mut cells, key).map(|c| &c.slot) {
            Some(Slot::Int(n)) => Some(*n),
            _ => None,
        }
    }

    /// Forget every key, as a cache eviction or restart would.
    pub fn evict_all(&self) {
        lock(&self.cells).clear();
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn set_count(&self, key: &str, value: i64) -> Result<(), AppError> {
        lock(&self.cells).insert(
            key.to_string(),
            Cell {
                slot: Slot::Int(value),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn decr_by(&self, key: &str, by: i64) -> Result<i64, AppError> {
        let mut cells = lock(&self.cells);
        match Self::live(&mut cells, key) {
            Some(Cell {
                slot: Slot::Int(n), ..
            }) => {
                *n -= by;
                Ok(*n)
            }
            Some(_) => Err(AppError::Internal(format!("{} does not hold an integer", key))),
            None => {
                cells.insert(
                    key.to_string(),
                    Cell {
                        slot: Slot::Int(-by),
                        expires_at: None,
                    },
                );
                Ok(-by)
            }
        }
    }

    async fn add_member(&self, key: &str, member: &str) -> Result<(), AppError> {
        let mut cells = lock(&self.cells);
        match Self::live(&mut cells, key) {
            Some(Cell {
                slot: Slot::Set(members),
                ..
            }) => {
                members.insert(member.to_string());
                Ok(())
            }
            Some(_) => Err(AppError::Internal(format!("{} does not hold a set", key))),
            None => {
                cells.insert(
                    key.to_string(),
                    Cell {
                        slot: Slot::Set(BTreeSet::from([member.to_string()])),
                        expires_at: None,
                    },
                );
                Ok(())
            }
        }
    }

    async fn members(&self, key: &str) -> Result<Vec<String>, AppError> {
        let mut cells = lock(&self.cells);
        match Self::live(&mut cells, key).map(|c| &c.slot) {
            Some(Slot::Set(members)) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(AppError::Internal(format!("{} does not hold a set", key))),
            None => Ok(Vec::new()),
        }
    }

    async fn delete(&self, keys: &[String]) -> Result<(), AppError> {
        let mut cells = lock(&self.cells);
        for key in keys {
            cells.remove(key);
        }
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, AppError> {
        let mut cells = lock(&self.cells);
        if Self::live(&mut cells, key).is_some() {
            return Ok(false);
        }
        cells.insert(
            key.to_string(),
            Cell {
                slot: Slot::Text(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }
}

// ============================================================
// Broker
// ============================================================

#[derive(Default)]
struct Queues {
    live: VecDeque<Envelope>,
    deferred: Vec<(Instant, Envelope)>,
    /// Unsettled deliveries with the instant they were received
    in_flight: HashMap<Uuid, (Instant, Envelope)>,
    dead_letter: Vec<Envelope>,
    callback_retry: Vec<String>,
    failing_publishes: usize,
}

impl Queues {
    /// Dead-letter expired deferred messages into the live queue, oldest expiry first.
    fn expire_deferred(&mut self, now: Instant) {
        let mut due: Vec<(Instant, Envelope)> = Vec::new();
        let mut waiting = Vec::with_capacity(self.deferred.len());
        for (at, envelope) in self.deferred.drain(..) {
            if at <= now {
                due.push((at, envelope));
            } else {
                waiting.push((at, envelope));
            }
        }
        self.deferred = waiting;
        due.sort_by_key(|(at, _)| *at);
        self.live.extend(due.into_iter().map(|(_, e)| e));
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.deferred.iter().map(|(at, _)| *at).min()
    }

    fn take_publish_failure(&mut self) -> bool {
        if self.failing_publishes > 0 {
            self.failing_publishes -= 1;
            true
        } else {
            false
        }
    }
}

/// In-memory broker with TTL dead-lettering from the deferred queue.
#[derive(Default)]
pub struct MemoryBroker {
    queues: Mutex<Queues>,
    arrivals: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` item publishes fail.
    pub fn fail_next_publishes(&self, n: usize) {
        lock(&self.queues).failing_publishes = n;
    }

    /// Return every unacknowledged message to the live queue, as the broker
    /// does when a consumer connection dies.
    pub fn requeue_in_flight(&self) -> usize {
        let mut queues = lock(&self.queues);
        let pending: Vec<Envelope> = queues.in_flight.drain().map(|(_, (_, e))| e).collect();
        let n = pending.len();
        queues.live.extend(pending);
        drop(queues);
        self.arrivals.notify_waiters();
        n
    }

    pub fn live_len(&self) -> usize {
        lock(&self.queues).live.len()
    }

    pub fn deferred_len(&self) -> usize {
        lock(&self.queues).deferred.len()
    }

    pub fn in_flight_len(&self) -> usize {
        lock(&self.queues).in_flight.len()
    }

    pub fn dead_letters(&self) -> Vec<Envelope> {
        lock(&self.queues).dead_letter.clone()
    }

    pub fn callback_retries(&self) -> Vec<String> {
        lock(&self.queues).callback_retry.clone()
    }

    /// Push a raw body onto the live queue, bypassing serialization checks.
    pub fn inject_raw(&self, routing_key: &str, body: &str) {
        lock(&self.queues).live.push_back(Envelope::new(routing_key, body));
        self.arrivals.notify_waiters();
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn publish(&self, routing_key: &str, body: &str) -> Result<(), AppError> {
        {
            let mut queues = lock(&self.queues);
            if queues.take_publish_failure() {
                return Err(AppError::Broker("publish not confirmed".to_string()));
            }
            queues.live.push_back(Envelope::new(routing_key, body));
        }
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn publish_deferred(
        &self,
        routing_key: &str,
        body: &str,
        ttl: Duration,
    ) -> Result<(), AppError> {
        {
            let mut queues = lock(&self.queues);
            if queues.take_publish_failure() {
                return Err(AppError::Broker("publish not confirmed".to_string()));
            }
            queues
                .deferred
                .push((Instant::now() + ttl, Envelope::new(routing_key, body)));
        }
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn publish_callback_retry(&self, body: &str) -> Result<(), AppError> {
        lock(&self.queues).callback_retry.push(body.to_string());
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Delivery>, AppError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut queues = lock(&self.queues);
                let now = Instant::now();
                queues.expire_deferred(now);
                if let Some(envelope) = queues.live.pop_front() {
                    queues.in_flight.insert(envelope.id, (now, envelope.clone()));
                    let raw = serde_json::to_string(&envelope)?;
                    return Ok(Some(Delivery { envelope, raw }));
                }
                if now >= deadline {
                    return Ok(None);
                }
                queues
                    .next_expiry()
                    .map_or(deadline, |at| at.min(deadline))
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), AppError> {
        lock(&self.queues).in_flight.remove(&delivery.envelope.id);
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery, reason: &str) -> Result<(), AppError> {
        let mut queues = lock(&self.queues);
        queues.in_flight.remove(&delivery.envelope.id);
        let mut dead = delivery.envelope.clone();
        dead.reject_reason = Some(reason.to_string());
        queues.dead_letter.push(dead);
        Ok(())
    }

    async fn requeue_expired(&self, older_than: Duration) -> Result<usize, AppError> {
        let n = {
            let mut queues = lock(&self.queues);
            let now = Instant::now();
            let mut expired: Vec<(Instant, Envelope)> = Vec::new();
            queues.in_flight.retain(|_, (received_at, envelope)| {
                if now.duration_since(*received_at) >= older_than {
                    expired.push((*received_at, envelope.clone()));
                    false
                } else {
                    true
                }
            });
            expired.sort_by_key(|(at, _)| *at);
            let n = expired.len();
            queues.live.extend(expired.into_iter().map(|(_, e)| e));
            n
        };
        if n > 0 {
            self.arrivals.notify_waiters();
        }
        Ok(n)
    }
}

// ============================================================
// Persistent store
// ============================================================

#[derive(Default)]
struct Tables {
    accounts: HashMap<Uuid, Account>,
    template_settings: Vec<TemplateSetting>,
    tasks: HashMap<Uuid, TaskRecord>,
    items: Vec<ItemRecord>,
    failing_item_writes: usize,
    failing_item_reads: usize,
}

/// In-memory persistent store.
#[derive(Default)]
pub struct MemoryDispatchStore {
    tables: Mutex<Tables>,
}

impl MemoryDispatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_account(&self, account: Account) {
        lock(&self.tables).accounts.insert(account.id, account);
    }

    pub fn insert_template_setting(&self, setting: TemplateSetting) {
        lock(&self.tables).template_settings.push(setting);
    }

    /// Move a task's creation time, e.g. to make it look stuck.
    pub fn backdate_task(&self, task_id: Uuid, created_at: DateTime<Utc>) {
        if let Some(task) = lock(&self.tables).tasks.get_mut(&task_id) {
            task.created_at = created_at;
        }
    }

    /// Make the next `n` item inserts fail.
    pub fn fail_next_item_writes(&self, n: usize) {
        lock(&self.tables).failing_item_writes = n;
    }

    /// Make the next `n` item reads fail.
    pub fn fail_next_item_reads(&self, n: usize) {
        lock(&self.tables).failing_item_reads = n;
    }

    pub fn task_count(&self) -> usize {
        lock(&self.tables).tasks.len()
    }

    pub fn task(&self, task_id: Uuid) -> Option<TaskRecord> {
        lock(&self.tables).tasks.get(&task_id).cloned()
    }

    pub fn items(&self, task_id: Uuid) -> Vec<ItemRecord> {
        lock(&self.tables)
            .items
            .iter()
            .filter(|i| i.task_id == task_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DispatchStore for MemoryDispatchStore {
    async fn find_account(&self, account_id: Uuid) -> Result<Option<Account>, AppError> {
        Ok(lock(&self.tables).accounts.get(&account_id).cloned())
    }

    async fn find_template_setting(
        &self,
        app_id: &str,
        template_short_id: &str,
    ) -> Result<Option<TemplateSetting>, AppError> {
        Ok(lock(&self.tables)
            .template_settings
            .iter()
            .find(|s| s.app_id == app_id && s.template_short_id == template_short_id)
            .cloned())
    }

    async fn create_task(&self, task: NewTask) -> Result<TaskRecord, AppError> {
        let now = Utc::now();
        let record = TaskRecord {
            id: Uuid::new_v4(),
            batch_count: task.batch_count,
            params: task.params,
            executor_id: task.executor_id,
            task_type: task.task_type,
            is_delay: task.is_delay,
            plan_time: task.plan_time,
            callback_url: task.callback_url,
            progress: TaskProgress::Ready,
            created_at: now,
            updated_at: now,
        };
        lock(&self.tables).tasks.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskRecord>, AppError> {
        Ok(self.task(task_id))
    }

    async fn set_batch_count(&self, task_id: Uuid, batch_count: i32) -> Result<(), AppError> {
        if let Some(task) = lock(&self.tables).tasks.get_mut(&task_id) {
            task.batch_count = batch_count;
            task.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn complete_task(&self, task_id: Uuid) -> Result<bool, AppError> {
        let mut tables = lock(&self.tables);
        match tables.tasks.get_mut(&task_id) {
            Some(task) if task.progress == TaskProgress::Ready => {
                task.progress = TaskProgress::Complete;
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_stale_ready(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>, AppError> {
        let mut stale: Vec<TaskRecord> = lock(&self.tables)
            .tasks
            .values()
            .filter(|t| t.progress == TaskProgress::Ready)
            .filter(|t| t.plan_time.unwrap_or(t.created_at) < started_before)
            .cloned()
            .collect();
        stale.sort_by_key(|t| t.created_at);
        Ok(stale)
    }

    async fn insert_item(&self, item: &ItemRecord) -> Result<(), AppError> {
        self.insert_items(std::slice::from_ref(item)).await?;
        Ok(())
    }

    async fn insert_items(&self, items: &[ItemRecord]) -> Result<u64, AppError> {
        let mut tables = lock(&self.tables);
        if tables.failing_item_writes > 0 {
            tables.failing_item_writes -= 1;
            return Err(AppError::Internal("item write failed".to_string()));
        }
        tables.items.extend(items.iter().cloned());
        Ok(items.len() as u64)
    }

    async fn persisted_temp_msg_ids(&self, task_id: Uuid) -> Result<HashSet<String>, AppError> {
        Ok(lock(&self.tables)
            .items
            .iter()
            .filter(|i| i.task_id == task_id)
            .map(|i| i.temp_msg_id.clone())
            .collect())
    }

    async fn items_for_task(&self, task_id: Uuid) -> Result<Vec<ItemRecord>, AppError> {
        {
            let mut tables = lock(&self.tables);
            if tables.failing_item_reads > 0 {
                tables.failing_item_reads -= 1;
                return Err(AppError::Internal("item read failed".to_string()));
            }
        }
        Ok(self.items(task_id))
    }

    async fn mark_receipt(
        &self,
        msg_id: &str,
        status: PushStatus,
        reason: Option<&str>,
    ) -> Result<u64, AppError> {
        if !matches!(status, PushStatus::ReceiveSuccess | PushStatus::ReceiveFailed) {
            return Err(AppError::validation(format!(
                "{} is not a receipt status",
                status
            )));
        }
        let mut updated = 0;
        for item in lock(&self.tables)
            .items
            .iter_mut()
            .filter(|i| i.msg_id.as_deref() == Some(msg_id))
        {
            item.status = status;
            if let Some(reason) = reason {
                item.fail_reason = Some(reason.to_string());
            }
            updated += 1;
        }
        Ok(updated)
    }
}
