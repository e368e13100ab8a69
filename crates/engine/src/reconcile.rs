//! Reconciliation sweep.
//!
//! Finds READY tasks that started more than the staleness threshold ago and
//! completes them from durable state. Outcomes still sitting in the counter
//! store are inserted if the store does not have them yet (matched by
//! `temp_msg_id`). The callback is not invoked for recovered tasks.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use herald_common::error::AppError;
use herald_common::types::{ItemRecord, TaskRecord};

use crate::counter::{CounterStore, TaskKeys};
use crate::message::OutcomeEntry;
use crate::scheduler::PeriodicJob;
use crate::store::DispatchStore;

pub const JOB_NAME: &str = "message_reconcile";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stale tasks found
    pub examined: usize,
    /// Tasks this sweep moved to COMPLETE
    pub recovered: usize,
    /// Item Records inserted from the outcome sets
    pub inserted: u64,
}

pub struct ReconciliationSweep {
    store: Arc<dyn DispatchStore>,
    counter: Arc<dyn CounterStore>,
    stale_after: chrono::Duration,
}

impl ReconciliationSweep {
    pub fn new(
        store: Arc<dyn DispatchStore>,
        counter: Arc<dyn CounterStore>,
        stale_after: chrono::Duration,
    ) -> Self {
        Self {
            store,
            counter,
            stale_after,
        }
    }

    pub async fn run_once(&self) -> Result<SweepReport, AppError> {
        let cutoff = Utc::now() - self.stale_after;
        let stale = self.store.find_stale_ready(cutoff).await?;

        let mut report = SweepReport {
            examined: stale.len(),
            ..Default::default()
        };

        for task in &stale {
            match self.recover(task).await {
                Ok((inserted, completed)) => {
                    report.inserted += inserted;
                    if completed {
                        report.recovered += 1;
                    }
                }
                Err(e) => {
                    tracing::error!(task_id = %task.id, error = %e, "Failed to reconcile task");
                }
            }
        }

        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                recovered = report.recovered,
                inserted = report.inserted,
                "Reconciliation sweep finished"
            );
        }
        Ok(report)
    }

    async fn recover(&self, task: &TaskRecord) -> Result<(u64, bool), AppError> {
        let keys = TaskKeys::new(task.id);

        // a late worker's decrement now goes below zero and reaches the
        // finalizer, which the progress gate turns into a no-op once the task
        // is complete
        if let Err(e) = self.counter.delete(std::slice::from_ref(&keys.count)).await {
            tracing::warn!(task_id = %task.id, error = %e, "Could not delete residual count");
        }

        let mut members = Vec::new();
        for key in [&keys.succeeded, &keys.failed] {
            match self.counter.members(key).await {
                Ok(found) => members.extend(found),
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "Outcome set unreadable, relying on store");
                }
            }
        }

        let persisted = self.store.persisted_temp_msg_ids(task.id).await?;
        let missing = missing_records(task, members, &persisted);
        let inserted = self.store.insert_items(&missing).await?;

        if let Err(e) = self.counter.delete(&keys.all()).await {
            tracing::warn!(task_id = %task.id, error = %e, "Could not delete task keys");
        }

        let completed = self.store.complete_task(task.id).await?;
        if completed {
            tracing::info!(
                task_id = %task.id,
                persisted = persisted.len(),
                inserted,
                batch_count = task.batch_count,
                "Stale task recovered"
            );
        }
        Ok((inserted, completed))
    }
}

/// Records from the outcome sets that belong to `task` and are not yet
/// persisted, at most one per correlation id.
fn missing_records(
    task: &TaskRecord,
    members: Vec<String>,
    persisted: &HashSet<String>,
) -> Vec<ItemRecord> {
    let mut seen = HashSet::new();
    members
        .iter()
        .filter_map(|m| OutcomeEntry::parse(m).into_record())
        .filter(|r| r.task_id == task.id)
        .filter(|r| !persisted.contains(&r.temp_msg_id))
        .filter(|r| seen.insert(r.temp_msg_id.clone()))
        .collect()
}

#[async_trait]
impl PeriodicJob for ReconciliationSweep {
    fn name(&self) -> &str {
        JOB_NAME
    }

    async fn run(&self) -> Result<(), AppError> {
        self.run_once().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryCounterStore, MemoryDispatchStore};
    use crate::testing::new_task;
    use herald_common::types::PushStatus;
    use uuid::Uuid;

    fn record(task_id: Uuid, temp: &str) -> ItemRecord {
        ItemRecord {
            id: Uuid::new_v4(),
            msg_id: Some(format!("m-{}", temp)),
            temp_msg_id: temp.to_string(),
            recipient: format!("user-{}", temp),
            template_id: "tpl".to_string(),
            url: None,
            color: None,
            data: serde_json::json!({}),
            miniprogram_app_id: None,
            miniprogram_pagepath: None,
            executor_id: Uuid::new_v4(),
            task_id,
            status: PushStatus::PushSuccess,
            fail_reason: None,
            created_at: Utc::now(),
        }
    }

    fn sweep(store: Arc<MemoryDispatchStore>, counter: Arc<MemoryCounterStore>) -> ReconciliationSweep {
        ReconciliationSweep::new(store, counter, chrono::Duration::minutes(30))
    }

    #[test]
    fn test_missing_records_dedups_and_filters_foreign_tasks() {
        let task = TaskRecord {
            id: Uuid::new_v4(),
            batch_count: 3,
            params: "{}".to_string(),
            executor_id: Uuid::new_v4(),
            task_type: herald_common::types::TaskType::Templated,
            is_delay: false,
            plan_time: None,
            callback_url: None,
            progress: herald_common::types::TaskProgress::Ready,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let a = serde_json::to_string(&record(task.id, "a")).unwrap();
        let a_again = serde_json::to_string(&record(task.id, "a")).unwrap();
        let b = serde_json::to_string(&record(task.id, "b")).unwrap();
        let foreign = serde_json::to_string(&record(Uuid::new_v4(), "c")).unwrap();
        let persisted = HashSet::from(["b".to_string()]);

        let missing = missing_records(
            &task,
            vec![a, a_again, b, foreign, "bare-id".to_string()],
            &persisted,
        );
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].temp_msg_id, "a");
    }

    #[tokio::test]
    async fn test_fresh_task_is_left_alone() {
        let store = Arc::new(MemoryDispatchStore::new());
        let counter = Arc::new(MemoryCounterStore::new());
        let task = store.create_task(new_task(1, None)).await.unwrap();

        let report = sweep(store.clone(), counter).run_once().await.unwrap();
        assert_eq!(report, SweepReport::default());
        assert!(!store.task(task.id).unwrap().is_complete());
    }

    #[tokio::test]
    async fn test_stale_task_without_any_state_is_completed() {
        let store = Arc::new(MemoryDispatchStore::new());
        let counter = Arc::new(MemoryCounterStore::new());
        let task = store.create_task(new_task(2, None)).await.unwrap();
        store.backdate_task(task.id, Utc::now() - chrono::Duration::minutes(31));

        let report = sweep(store.clone(), counter).run_once().await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.recovered, 1);
        assert_eq!(report.inserted, 0);
        assert!(store.task(task.id).unwrap().is_complete());
    }

    #[tokio::test]
    async fn test_failed_insert_leaves_task_ready() {
        let store = Arc::new(MemoryDispatchStore::new());
        let counter = Arc::new(MemoryCounterStore::new());
        let task = store.create_task(new_task(1, None)).await.unwrap();
        store.backdate_task(task.id, Utc::now() - chrono::Duration::hours(1));
        let keys = TaskKeys::new(task.id);
        counter
            .add_member(&keys.succeeded, &serde_json::to_string(&record(task.id, "a")).unwrap())
            .await
            .unwrap();
        store.fail_next_item_writes(1);

        let report = sweep(store.clone(), counter).run_once().await.unwrap();
        assert_eq!(report.recovered, 0);
        assert!(!store.task(task.id).unwrap().is_complete());
    }
}
