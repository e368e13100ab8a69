//! Dispatch planner.
//!
//! Turns one send request into a READY task plus one published item per
//! recipient. Shape errors reject the whole request before anything is
//! written. Publish failures are reported per item and shrink the number of
//! items the task waits for.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use herald_common::config::{BrokerTopology, DispatchSettings};
use herald_common::error::AppError;
use herald_common::types::{Account, TaskType};
use herald_notifier::provider::MiniProgram;

use crate::broker::MessageBroker;
use crate::counter::{CounterStore, TaskKeys};
use crate::finalizer::CompletionFinalizer;
use crate::message::{AccountSnapshot, ItemMessage};
use crate::store::{DispatchStore, NewTask};

/// Mini-program link of a request: one path for all recipients, or one each.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiniProgramRequest {
    pub appid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagepath: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagepaths: Option<Vec<String>>,
}

/// A templated send request.
///
/// Each per-recipient field has a single form (`url`, `data`, `pagepath`) and
/// a list form (`urls`, `dataList`, `pagepaths`) whose length must equal the
/// number of recipients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub tousers: Vec<String>,
    /// Short template id, resolved through the account's template settings
    pub template_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_list: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub miniprogram: Option<MiniProgramRequest>,
    /// Send time in epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptEntry {
    pub recipient: String,
    /// Correlation id of the item
    pub msg_id: String,
}

/// Publish-time acceptance, not delivery outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    pub task_id: Uuid,
    pub succeeded: Vec<ReceiptEntry>,
    pub failed: Vec<ReceiptEntry>,
}

/// Per-recipient fields after validation.
#[derive(Debug, Clone, PartialEq)]
struct PlannedItem {
    recipient: String,
    url: Option<String>,
    data: serde_json::Value,
    miniprogram: Option<MiniProgram>,
}

/// One of a single value for everyone or a list with one entry per recipient.
fn pick<T: Clone>(
    field: &str,
    single: Option<&T>,
    list: Option<&Vec<T>>,
    n: usize,
) -> Result<Option<Vec<T>>, AppError> {
    match (single, list) {
        (Some(_), Some(_)) => Err(AppError::validation(format!(
            "{field} and {field}s are mutually exclusive"
        ))),
        (Some(v), None) => Ok(Some(vec![v.clone(); n])),
        (None, Some(vs)) if vs.len() != n => Err(AppError::validation(format!(
            "{field}s has {} entries for {n} recipients",
            vs.len()
        ))),
        (None, Some(vs)) => Ok(Some(vs.clone())),
        (None, None) => Ok(None),
    }
}

/// Validate the request shape and expand it into one entry per unique
/// recipient, in request order. Duplicate recipients keep their first entry.
fn expand(request: &SendRequest) -> Result<Vec<PlannedItem>, AppError> {
    let n = request.tousers.len();
    if n == 0 {
        return Err(AppError::validation("tousers must not be empty"));
    }
    if request.tousers.iter().any(|u| u.trim().is_empty()) {
        return Err(AppError::validation("tousers contains an empty recipient"));
    }
    if request.template_id.trim().is_empty() {
        return Err(AppError::validation("templateId is required"));
    }

    let urls = pick("url", request.url.as_ref(), request.urls.as_ref(), n)?;
    let data = match (&request.data, &request.data_list) {
        (Some(_), Some(_)) => {
            return Err(AppError::validation("data and dataList are mutually exclusive"));
        }
        (None, None) => return Err(AppError::validation("one of data or dataList is required")),
        (Some(d), None) => vec![d.clone(); n],
        (None, Some(list)) if list.len() != n => {
            return Err(AppError::validation(format!(
                "dataList has {} entries for {n} recipients",
                list.len()
            )));
        }
        (None, Some(list)) => list.clone(),
    };
    let pagepaths = match &request.miniprogram {
        Some(mp) => Some(
            pick("pagepath", mp.pagepath.as_ref(), mp.pagepaths.as_ref(), n)?.ok_or_else(
                || AppError::validation("miniprogram requires pagepath or pagepaths"),
            )?,
        ),
        None => None,
    };

    let mut seen = HashSet::with_capacity(n);
    let mut items = Vec::with_capacity(n);
    for (i, recipient) in request.tousers.iter().enumerate() {
        if !seen.insert(recipient.as_str()) {
            continue;
        }
        let miniprogram = match (&request.miniprogram, &pagepaths) {
            (Some(mp), Some(paths)) => Some(MiniProgram {
                appid: mp.appid.clone(),
                pagepath: paths[i].clone(),
            }),
            _ => None,
        };
        items.push(PlannedItem {
            recipient: recipient.clone(),
            url: urls.as_ref().map(|u| u[i].clone()),
            data: data[i].clone(),
            miniprogram,
        });
    }
    Ok(items)
}

pub struct DispatchPlanner {
    store: Arc<dyn DispatchStore>,
    counter: Arc<dyn CounterStore>,
    broker: Arc<dyn MessageBroker>,
    finalizer: Arc<CompletionFinalizer>,
    settings: DispatchSettings,
    routing_key: String,
}

impl DispatchPlanner {
    pub fn new(
        store: Arc<dyn DispatchStore>,
        counter: Arc<dyn CounterStore>,
        broker: Arc<dyn MessageBroker>,
        finalizer: Arc<CompletionFinalizer>,
        settings: DispatchSettings,
        topology: &BrokerTopology,
    ) -> Self {
        Self {
            store,
            counter,
            broker,
            finalizer,
            settings,
            routing_key: topology.routing_key.clone(),
        }
    }

    /// Decide whether `delay_time` defers the batch. A deferred batch always
    /// carries its plan time; one that cannot be represented or lies beyond
    /// `max_delay_ms` is rejected.
    fn schedule(
        &self,
        delay_time: Option<i64>,
    ) -> Result<(bool, i64, Option<DateTime<Utc>>), AppError> {
        let Some(at) = delay_time else {
            return Ok((false, 0, None));
        };
        let delay_ms = at.saturating_sub(Utc::now().timestamp_millis());
        if delay_ms <= self.settings.delay_threshold_ms {
            return Ok((false, 0, None));
        }
        if delay_ms > self.settings.max_delay_ms {
            return Err(AppError::validation(format!(
                "delayTime may be at most {} ms ahead",
                self.settings.max_delay_ms
            )));
        }
        let plan_time = DateTime::from_timestamp_millis(at)
            .ok_or_else(|| AppError::validation("delayTime is out of range"))?;
        Ok((true, delay_ms, Some(plan_time)))
    }

    pub async fn plan(&self, account: &Account, request: SendRequest) -> Result<SendReceipt, AppError> {
        let planned = expand(&request)?;
        let (is_delay, delay_ms, plan_time) = self.schedule(request.delay_time)?;

        let template = self
            .store
            .find_template_setting(&account.app_id, &request.template_id)
            .await?
            .ok_or_else(|| {
                AppError::validation(format!(
                    "template {} is not configured for this account",
                    request.template_id
                ))
            })?;

        let total = planned.len();
        let task = self
            .store
            .create_task(NewTask {
                batch_count: total as i32,
                params: serde_json::to_string(&request)?,
                executor_id: account.id,
                task_type: TaskType::Templated,
                is_delay,
                plan_time,
                callback_url: account.callback_url.clone(),
            })
            .await?;

        let keys = TaskKeys::new(task.id);
        self.counter.set_count(&keys.count, total as i64).await?;

        let snapshot = AccountSnapshot {
            id: account.id,
            app_id: account.app_id.clone(),
            app_secret: account.app_secret.clone(),
        };
        let mut receipt = SendReceipt {
            task_id: task.id,
            succeeded: Vec::with_capacity(total),
            failed: Vec::new(),
        };

        for (i, item) in planned.into_iter().enumerate() {
            let message = ItemMessage {
                task_id: task.id,
                temp_msg_id: Uuid::new_v4().to_string(),
                order_id: i + 1,
                recipient: item.recipient,
                template_id: template.template_id.clone(),
                url: item.url,
                color: request.color.clone(),
                data: item.data,
                miniprogram: item.miniprogram,
                account: snapshot.clone(),
                callback_url: account.callback_url.clone(),
            };
            let entry = ReceiptEntry {
                recipient: message.recipient.clone(),
                msg_id: message.temp_msg_id.clone(),
            };

            let published = match serde_json::to_string(&message) {
                Ok(body) if is_delay => {
                    let ttl = Duration::from_millis(delay_ms as u64);
                    self.broker.publish_deferred(&self.routing_key, &body, ttl).await
                }
                Ok(body) => self.broker.publish(&self.routing_key, &body).await,
                Err(e) => Err(e.into()),
            };

            match published {
                Ok(()) => receipt.succeeded.push(entry),
                Err(e) => {
                    tracing::warn!(
                        task_id = %task.id,
                        temp_msg_id = %entry.msg_id,
                        error = %e,
                        "Item publish failed"
                    );
                    receipt.failed.push(entry);
                }
            }
        }

        if !receipt.failed.is_empty() {
            self.settle_publish_failures(&keys, &receipt).await?;
        }

        tracing::info!(
            task_id = %task.id,
            accepted = receipt.succeeded.len(),
            rejected = receipt.failed.len(),
            is_delay,
            "Dispatch planned"
        );

        Ok(receipt)
    }

    /// Shrink the task to the items that were actually published.
    async fn settle_publish_failures(
        &self,
        keys: &TaskKeys,
        receipt: &SendReceipt,
    ) -> Result<(), AppError> {
        let task_id = receipt.task_id;
        let accepted = receipt.succeeded.len();

        if accepted == 0 {
            // nothing will ever be consumed for this task
            self.store.complete_task(task_id).await?;
            self.counter.delete(&keys.all()).await?;
            return Ok(());
        }

        self.store.set_batch_count(task_id, accepted as i32).await?;
        let remaining = self
            .counter
            .decr_by(&keys.count, receipt.failed.len() as i64)
            .await?;

        // every accepted item was already handled before the count shrank
        if remaining <= 0 {
            self.finalizer.finalize(task_id).await?;
        }
        Ok(())
    }
}
