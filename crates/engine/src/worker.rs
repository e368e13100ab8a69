//! Delivery worker.
//!
//! Handles one item message per call:
//! 1. Parse the payload, dead-lettering it on failure
//! 2. Send to the provider, retrying in-process up to the attempt bound
//! 3. Persist the Item Record on both the success and the failure path
//! 4. Add the serialized record to the task's outcome set
//! 5. Decrement the task's remaining count
//! 6. Ack the message
//! 7. Finalize the task if the count reached zero
//!
//! Nothing here returns an error: every failure after parsing is absorbed and
//! logged, so one bad item never takes down the consumer loop.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use herald_common::config::DispatchSettings;
use herald_notifier::provider::NotificationProvider;

use crate::broker::{Delivery, MessageBroker};
use crate::counter::{CounterStore, TaskKeys};
use crate::finalizer::CompletionFinalizer;
use crate::message::{DeliveryOutcome, ItemMessage};
use crate::store::DispatchStore;

/// Pause after a failed receive before polling again.
const RECEIVE_BACKOFF: Duration = Duration::from_secs(1);

/// Result of handling one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    /// Malformed message, moved to the dead-letter queue
    Rejected { reason: String },
    Processed {
        task_id: Uuid,
        outcome: DeliveryOutcome,
        /// Count after this item's decrement, if the decrement went through
        remaining: Option<i64>,
    },
}

pub struct DeliveryWorker {
    broker: Arc<dyn MessageBroker>,
    counter: Arc<dyn CounterStore>,
    store: Arc<dyn DispatchStore>,
    provider: Arc<dyn NotificationProvider>,
    finalizer: Arc<CompletionFinalizer>,
    settings: DispatchSettings,
    routing_key: String,
}

impl DeliveryWorker {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        counter: Arc<dyn CounterStore>,
        store: Arc<dyn DispatchStore>,
        provider: Arc<dyn NotificationProvider>,
        finalizer: Arc<CompletionFinalizer>,
        settings: DispatchSettings,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            counter,
            store,
            provider,
            finalizer,
            settings,
            routing_key: routing_key.into(),
        }
    }

    /// Consume until `shutdown` fires. An item already being handled is
    /// finished before the loop exits.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(routing_key = %self.routing_key, "Delivery worker started");

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = self.broker.receive(self.settings.consume_timeout()) => r,
            };

            match received {
                Ok(Some(delivery)) => {
                    self.handle(delivery).await;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Broker receive failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVE_BACKOFF) => {}
                    }
                }
            }
        }

        tracing::info!("Delivery worker stopped");
    }

    pub async fn handle(&self, delivery: Delivery) -> Handled {
        let message = match self.parse(&delivery) {
            Ok(message) => message,
            Err(reason) => {
                tracing::error!(message_id = %delivery.envelope.id, reason = %reason, "Rejecting malformed item message");
                if let Err(e) = self.broker.reject(&delivery, &reason).await {
                    tracing::error!(message_id = %delivery.envelope.id, error = %e, "Reject failed");
                }
                return Handled::Rejected { reason };
            }
        };

        let task_id = message.task_id;
        let temp_msg_id = message.temp_msg_id.clone();
        let outcome = self.deliver(&message).await;
        let record = message.into_record(&outcome);

        if let Err(e) = self.store.insert_item(&record).await {
            tracing::error!(task_id = %task_id, temp_msg_id = %temp_msg_id, error = %e, "Failed to persist item record");
        }

        let keys = TaskKeys::new(task_id);
        let set_key = if outcome.is_success() {
            &keys.succeeded
        } else {
            &keys.failed
        };
        match serde_json::to_string(&record) {
            Ok(member) => {
                if let Err(e) = self.counter.add_member(set_key, &member).await {
                    tracing::error!(task_id = %task_id, temp_msg_id = %temp_msg_id, error = %e, "Failed to record outcome");
                }
            }
            Err(e) => {
                tracing::error!(task_id = %task_id, temp_msg_id = %temp_msg_id, error = %e, "Failed to serialize outcome");
            }
        }

        let remaining = match self.counter.decr_by(&keys.count, 1).await {
            Ok(n) => Some(n),
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "Failed to decrement task count");
                None
            }
        };

        if let Err(e) = self.broker.ack(&delivery).await {
            tracing::error!(task_id = %task_id, message_id = %delivery.envelope.id, error = %e, "Ack failed");
        }

        if remaining.is_some_and(|n| n <= 0) {
            if let Err(e) = self.finalizer.finalize(task_id).await {
                tracing::error!(task_id = %task_id, error = %e, "Finalization failed");
            }
        }

        Handled::Processed {
            task_id,
            outcome,
            remaining,
        }
    }

    fn parse(&self, delivery: &Delivery) -> Result<ItemMessage, String> {
        if delivery.routing_key() != self.routing_key {
            return Err(format!("unexpected routing key {:?}", delivery.routing_key()));
        }
        serde_json::from_str(delivery.body()).map_err(|e| format!("invalid item payload: {}", e))
    }

    async fn deliver(&self, message: &ItemMessage) -> DeliveryOutcome {
        let credentials = message.account.credentials();
        let payload = message.to_provider_message();
        let max_attempts = self.settings.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.provider.send(&credentials, &payload).await {
                Ok(msg_id) => {
                    tracing::debug!(
                        task_id = %message.task_id,
                        temp_msg_id = %message.temp_msg_id,
                        msg_id = %msg_id,
                        attempt,
                        "Item delivered"
                    );
                    return DeliveryOutcome::Success { msg_id };
                }
                Err(e) => {
                    tracing::warn!(
                        task_id = %message.task_id,
                        temp_msg_id = %message.temp_msg_id,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Provider send failed"
                    );
                    last_error = e.to_string();
                }
            }
        }

        DeliveryOutcome::Failure { reason: last_error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBroker, MemoryCounterStore, MemoryDispatchStore};
    use crate::message::AccountSnapshot;
    use crate::testing::{RecordingCallback, ScriptedProvider, new_task};
    use herald_common::types::PushStatus;

    const KEY: &str = "notification/template";

    struct Fixture {
        broker: Arc<MemoryBroker>,
        counter: Arc<MemoryCounterStore>,
        store: Arc<MemoryDispatchStore>,
        provider: Arc<ScriptedProvider>,
        callback: Arc<RecordingCallback>,
        worker: DeliveryWorker,
    }

    fn fixture() -> Fixture {
        let broker = Arc::new(MemoryBroker::new());
        let counter = Arc::new(MemoryCounterStore::new());
        let store = Arc::new(MemoryDispatchStore::new());
        let provider = Arc::new(ScriptedProvider::new());
        let callback = Arc::new(RecordingCallback::ok());
        let finalizer = Arc::new(CompletionFinalizer::new(
            store.clone(),
            counter.clone(),
            broker.clone(),
            callback.clone(),
        ));
        let worker = DeliveryWorker::new(
            broker.clone(),
            counter.clone(),
            store.clone(),
            provider.clone(),
            finalizer,
            DispatchSettings::default(),
            KEY,
        );
        Fixture {
            broker,
            counter,
            store,
            provider,
            callback,
            worker,
        }
    }

    fn item(task_id: Uuid, recipient: &str) -> ItemMessage {
        ItemMessage {
            task_id,
            temp_msg_id: Uuid::new_v4().to_string(),
            order_id: 1,
            recipient: recipient.to_string(),
            template_id: "tpl-notice".to_string(),
            url: None,
            color: None,
            data: serde_json::json!({"first": {"value": "hi"}}),
            miniprogram: None,
            account: AccountSnapshot {
                id: Uuid::new_v4(),
                app_id: "wx".to_string(),
                app_secret: "s".to_string(),
            },
            callback_url: None,
        }
    }

    async fn receive(broker: &MemoryBroker) -> Delivery {
        broker
            .receive(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_malformed_message_is_dead_lettered_without_decrement() {
        let f = fixture();
        f.broker.inject_raw(KEY, "{not json");
        let delivery = receive(&f.broker).await;

        let handled = f.worker.handle(delivery).await;
        assert!(matches!(handled, Handled::Rejected { .. }));
        assert_eq!(f.broker.dead_letters().len(), 1);
        assert_eq!(f.broker.in_flight_len(), 0);
        assert_eq!(f.provider.total_attempts(), 0);
    }

    #[tokio::test]
    async fn test_unknown_routing_key_is_rejected() {
        let f = fixture();
        let body = serde_json::to_string(&item(Uuid::new_v4(), "u1")).unwrap();
        f.broker.publish("other/key", &body).await.unwrap();

        let handled = f.worker.handle(receive(&f.broker).await).await;
        assert!(matches!(handled, Handled::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let f = fixture();
        let task = f.store.create_task(new_task(2, None)).await.unwrap();
        f.counter.set_count(&TaskKeys::new(task.id).count, 2).await.unwrap();
        f.provider.fail_times("u1", 2);

        let body = serde_json::to_string(&item(task.id, "u1")).unwrap();
        f.broker.publish(KEY, &body).await.unwrap();
        let handled = f.worker.handle(receive(&f.broker).await).await;

        match handled {
            Handled::Processed { outcome, remaining, .. } => {
                assert!(outcome.is_success());
                assert_eq!(remaining, Some(1));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(f.provider.attempts("u1"), 3);
        assert_eq!(f.store.items(task.id)[0].status, PushStatus::PushSuccess);
        assert_eq!(f.broker.in_flight_len(), 0);
        assert!(f.callback.calls().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_record_failure_and_ack() {
        let f = fixture();
        let task = f.store.create_task(new_task(1, Some("/cb"))).await.unwrap();
        f.counter.set_count(&TaskKeys::new(task.id).count, 1).await.unwrap();
        f.provider.fail_always("u1");

        let body = serde_json::to_string(&item(task.id, "u1")).unwrap();
        f.broker.publish(KEY, &body).await.unwrap();
        f.worker.handle(receive(&f.broker).await).await;

        assert_eq!(f.provider.attempts("u1"), 3);
        let items = f.store.items(task.id);
        assert_eq!(items[0].status, PushStatus::PushFailed);
        assert!(!items[0].fail_reason.clone().unwrap_or_default().is_empty());
        assert_eq!(f.broker.in_flight_len(), 0);
        assert!(f.broker.dead_letters().is_empty());

        // last item: the worker finalized the task
        assert!(f.store.task(task.id).unwrap().is_complete());
        let calls = f.callback.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.failed.len(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_is_absorbed() {
        let f = fixture();
        let task = f.store.create_task(new_task(2, None)).await.unwrap();
        f.counter.set_count(&TaskKeys::new(task.id).count, 2).await.unwrap();
        f.store.fail_next_item_writes(1);

        let body = serde_json::to_string(&item(task.id, "u1")).unwrap();
        f.broker.publish(KEY, &body).await.unwrap();
        let handled = f.worker.handle(receive(&f.broker).await).await;

        assert!(matches!(handled, Handled::Processed { remaining: Some(1), .. }));
        assert!(f.store.items(task.id).is_empty());
        // the outcome set still carries the record for the sweep
        let members = f
            .counter
            .members(&TaskKeys::new(task.id).succeeded)
            .await
            .unwrap();
        assert_eq!(members.len(), 1);
    }
}
