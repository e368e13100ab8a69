//! Completion finalizer.
//!
//! Runs when a task's remaining count reaches zero. The Task Record's
//! `progress` column is the idempotence gate: the conditional READY to
//! COMPLETE update is claimed first, and only the caller that wins it builds
//! the summary and calls back. A second caller (a late worker, or the
//! reconciliation sweep) sees [`Finalization::AlreadyComplete`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{ItemRecord, PushStatus};
use herald_notifier::callback::{CallbackSink, CompletionSummary, FailedEntry};

use crate::broker::MessageBroker;
use crate::counter::{CounterStore, TaskKeys};
use crate::message::OutcomeEntry;
use crate::store::DispatchStore;

/// Body published to the callback-retry exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackRetry {
    pub url: Option<String>,
    pub summary: CompletionSummary,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackResult {
    Delivered,
    /// Handed to the callback-retry exchange
    Deferred { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finalization {
    AlreadyComplete,
    Completed {
        summary: CompletionSummary,
        callback: CallbackResult,
    },
}

pub struct CompletionFinalizer {
    store: Arc<dyn DispatchStore>,
    counter: Arc<dyn CounterStore>,
    broker: Arc<dyn MessageBroker>,
    callback: Arc<dyn CallbackSink>,
}

impl CompletionFinalizer {
    pub fn new(
        store: Arc<dyn DispatchStore>,
        counter: Arc<dyn CounterStore>,
        broker: Arc<dyn MessageBroker>,
        callback: Arc<dyn CallbackSink>,
    ) -> Self {
        Self {
            store,
            counter,
            broker,
            callback,
        }
    }

    pub async fn finalize(&self, task_id: Uuid) -> Result<Finalization, AppError> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {}", task_id)))?;

        if task.is_complete() || !self.store.complete_task(task_id).await? {
            tracing::debug!(task_id = %task_id, "Task already complete, skipping finalization");
            return Ok(Finalization::AlreadyComplete);
        }

        let keys = TaskKeys::new(task_id);
        let (summary, callback) = match self.build_summary(task_id, &keys).await {
            Ok(summary) => {
                let url = task.callback_url.clone().unwrap_or_default();
                let callback = match self.callback.deliver(&url, &summary).await {
                    Ok(()) => CallbackResult::Delivered,
                    Err(e) => {
                        tracing::warn!(task_id = %task_id, error = %e, "Callback failed, publishing to retry exchange");
                        self.defer_callback(&task.callback_url, &summary, e.to_string())
                            .await
                    }
                };
                (summary, callback)
            }
            Err(e) => {
                // the task is already claimed, so nothing else will call back
                tracing::error!(task_id = %task_id, error = %e, "Summary unavailable, publishing empty summary to retry exchange");
                let summary = CompletionSummary {
                    task_id,
                    succeeded: Vec::new(),
                    failed: Vec::new(),
                };
                let callback = self
                    .defer_callback(
                        &task.callback_url,
                        &summary,
                        format!("summary unavailable: {}", e),
                    )
                    .await;
                (summary, callback)
            }
        };

        if let Err(e) = self.counter.delete(&keys.all()).await {
            tracing::error!(task_id = %task_id, error = %e, "Failed to delete task keys");
        }

        tracing::info!(
            task_id = %task_id,
            succeeded = summary.succeeded.len(),
            failed = summary.failed.len(),
            delivered = callback == CallbackResult::Delivered,
            "Task finalized"
        );

        Ok(Finalization::Completed { summary, callback })
    }

    async fn defer_callback(
        &self,
        url: &Option<String>,
        summary: &CompletionSummary,
        reason: String,
    ) -> CallbackResult {
        let retry = CallbackRetry {
            url: url.clone(),
            summary: summary.clone(),
            reason: reason.clone(),
        };
        let published = match serde_json::to_string(&retry) {
            Ok(body) => self.broker.publish_callback_retry(&body).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = published {
            tracing::error!(task_id = %summary.task_id, error = %e, "Callback retry publish failed");
        }
        CallbackResult::Deferred { reason }
    }

    /// Summary from the outcome sets, or from persisted items when the
    /// counter store cannot be read.
    async fn build_summary(
        &self,
        task_id: Uuid,
        keys: &TaskKeys,
    ) -> Result<CompletionSummary, AppError> {
        let sets = async {
            let succeeded = self.counter.members(&keys.succeeded).await?;
            let failed = self.counter.members(&keys.failed).await?;
            Ok::<_, AppError>((succeeded, failed))
        };

        match sets.await {
            Ok((succeeded, failed)) => Ok(summary_from_members(task_id, &succeeded, &failed)),
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "Outcome sets unreadable, summarizing persisted items");
                let items = self.store.items_for_task(task_id).await?;
                Ok(summary_from_records(task_id, &items))
            }
        }
    }
}

pub fn summary_from_members(
    task_id: Uuid,
    succeeded: &[String],
    failed: &[String],
) -> CompletionSummary {
    CompletionSummary {
        task_id,
        succeeded: succeeded
            .iter()
            .map(|m| OutcomeEntry::parse(m).temp_msg_id().to_string())
            .collect(),
        failed: failed
            .iter()
            .map(|m| {
                let entry = OutcomeEntry::parse(m);
                FailedEntry {
                    msg_id: entry.temp_msg_id().to_string(),
                    errmsg: entry.fail_reason(),
                }
            })
            .collect(),
    }
}

pub fn summary_from_records(task_id: Uuid, items: &[ItemRecord]) -> CompletionSummary {
    let mut summary = CompletionSummary {
        task_id,
        succeeded: Vec::new(),
        failed: Vec::new(),
    };
    for item in items {
        match item.status {
            PushStatus::PushFailed | PushStatus::ReceiveFailed => summary.failed.push(FailedEntry {
                msg_id: item.temp_msg_id.clone(),
                errmsg: item.fail_reason.clone().unwrap_or_default(),
            }),
            _ => summary.succeeded.push(item.temp_msg_id.clone()),
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBroker, MemoryCounterStore, MemoryDispatchStore};
    use crate::testing::{RecordingCallback, new_task};

    struct Fixture {
        store: Arc<MemoryDispatchStore>,
        counter: Arc<MemoryCounterStore>,
        broker: Arc<MemoryBroker>,
        callback: Arc<RecordingCallback>,
        finalizer: CompletionFinalizer,
    }

    fn fixture(callback: RecordingCallback) -> Fixture {
        let store = Arc::new(MemoryDispatchStore::new());
        let counter = Arc::new(MemoryCounterStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let callback = Arc::new(callback);
        let finalizer = CompletionFinalizer::new(
            store.clone(),
            counter.clone(),
            broker.clone(),
            callback.clone(),
        );
        Fixture {
            store,
            counter,
            broker,
            callback,
            finalizer,
        }
    }

    #[test]
    fn test_summary_from_bare_members() {
        let id = Uuid::new_v4();
        let summary = summary_from_members(id, &["a".to_string()], &["b".to_string()]);
        assert_eq!(summary.succeeded, vec!["a"]);
        assert_eq!(summary.failed[0].msg_id, "b");
        assert_eq!(summary.failed[0].errmsg, "");
    }

    #[tokio::test]
    async fn test_callback_failure_goes_to_retry_exchange() {
        let f = fixture(RecordingCallback::failing());
        let task = f.store.create_task(new_task(1, Some("/done"))).await.unwrap();
        let keys = TaskKeys::new(task.id);
        f.counter.add_member(&keys.succeeded, "tmp-1").await.unwrap();

        let result = f.finalizer.finalize(task.id).await.unwrap();
        match result {
            Finalization::Completed { callback, .. } => {
                assert!(matches!(callback, CallbackResult::Deferred { .. }))
            }
            other => panic!("unexpected {:?}", other),
        }

        let retries = f.broker.callback_retries();
        assert_eq!(retries.len(), 1);
        let retry: CallbackRetry = serde_json::from_str(&retries[0]).unwrap();
        assert_eq!(retry.url.as_deref(), Some("/done"));
        assert_eq!(retry.summary.succeeded, vec!["tmp-1"]);

        // cleanup and completion happen regardless
        assert!(!f.counter.exists(&keys.succeeded));
        assert!(f.store.task(task.id).unwrap().is_complete());
    }

    #[tokio::test]
    async fn test_unreadable_summary_still_defers_and_cleans_up() {
        let f = fixture(RecordingCallback::ok());
        let task = f.store.create_task(new_task(2, Some("/done"))).await.unwrap();
        let keys = TaskKeys::new(task.id);
        f.counter.set_count(&keys.count, 0).await.unwrap();
        f.counter.add_member(&keys.failed, "tmp-2").await.unwrap();
        // a non-set value under the set key makes the outcome read fail
        f.counter
            .set_if_absent(&keys.succeeded, "garbage", std::time::Duration::from_secs(3600))
            .await
            .unwrap();
        f.store.fail_next_item_reads(1);

        let result = f.finalizer.finalize(task.id).await.unwrap();
        match result {
            Finalization::Completed { summary, callback } => {
                assert!(summary.succeeded.is_empty() && summary.failed.is_empty());
                assert!(matches!(callback, CallbackResult::Deferred { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(f.callback.calls().is_empty());
        let retries = f.broker.callback_retries();
        assert_eq!(retries.len(), 1);
        let retry: CallbackRetry = serde_json::from_str(&retries[0]).unwrap();
        assert_eq!(retry.url.as_deref(), Some("/done"));
        assert!(retry.reason.starts_with("summary unavailable"));

        for key in keys.all() {
            assert!(!f.counter.exists(&key), "{} left behind", key);
        }
        assert!(f.store.task(task.id).unwrap().is_complete());
    }

    #[tokio::test]
    async fn test_second_finalize_is_noop() {
        let f = fixture(RecordingCallback::ok());
        let task = f.store.create_task(new_task(1, Some("/done"))).await.unwrap();

        assert!(matches!(
            f.finalizer.finalize(task.id).await.unwrap(),
            Finalization::Completed { .. }
        ));
        assert_eq!(
            f.finalizer.finalize(task.id).await.unwrap(),
            Finalization::AlreadyComplete
        );
        assert_eq!(f.callback.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let f = fixture(RecordingCallback::ok());
        let err = f.finalizer.finalize(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
