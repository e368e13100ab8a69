//! Item payloads carried over the broker and the outcomes derived from them.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use herald_common::types::{ItemRecord, PushStatus};
use herald_notifier::provider::{Credentials, MiniProgram, TemplateMessage};

/// Denormalized copy of the requesting account, so a worker never has to look
/// it up again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSnapshot {
    pub id: Uuid,
    pub app_id: String,
    pub app_secret: String,
}

impl AccountSnapshot {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            app_id: self.app_id.clone(),
            app_secret: self.app_secret.clone(),
        }
    }
}

/// One recipient's work item, as published to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemMessage {
    pub task_id: Uuid,
    /// Correlation id generated at publish time
    pub temp_msg_id: String,
    /// 1-based position in the request's recipient list
    pub order_id: usize,
    pub recipient: String,
    /// Resolved provider template id
    pub template_id: String,
    pub url: Option<String>,
    pub color: Option<String>,
    pub data: serde_json::Value,
    pub miniprogram: Option<MiniProgram>,
    pub account: AccountSnapshot,
    pub callback_url: Option<String>,
}

impl ItemMessage {
    pub fn to_provider_message(&self) -> TemplateMessage {
        TemplateMessage {
            touser: self.recipient.clone(),
            template_id: self.template_id.clone(),
            url: self.url.clone(),
            color: self.color.clone(),
            data: self.data.clone(),
            miniprogram: self.miniprogram.clone(),
        }
    }

    /// Build the durable record for this item with the given outcome.
    pub fn into_record(self, outcome: &DeliveryOutcome) -> ItemRecord {
        let (status, msg_id, fail_reason) = match outcome {
            DeliveryOutcome::Success { msg_id } => (PushStatus::PushSuccess, Some(msg_id.clone()), None),
            DeliveryOutcome::Failure { reason } => (PushStatus::PushFailed, None, Some(reason.clone())),
        };
        let (miniprogram_app_id, miniprogram_pagepath) = match self.miniprogram {
            Some(mp) => (Some(mp.appid), Some(mp.pagepath)),
            None => (None, None),
        };

        ItemRecord {
            id: Uuid::new_v4(),
            msg_id,
            temp_msg_id: self.temp_msg_id,
            recipient: self.recipient,
            template_id: self.template_id,
            url: self.url,
            color: self.color,
            data: self.data,
            miniprogram_app_id,
            miniprogram_pagepath,
            executor_id: self.account.id,
            task_id: self.task_id,
            status,
            fail_reason,
            created_at: Utc::now(),
        }
    }
}

/// Terminal result of delivering one item to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success { msg_id: String },
    Failure { reason: String },
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Success { .. })
    }
}

/// A member of a task's succeeded/failed outcome set.
///
/// Members are normally serialized [`ItemRecord`]s. Anything else is kept as a
/// bare correlation id.
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeEntry {
    Record(Box<ItemRecord>),
    Bare(String),
}

impl OutcomeEntry {
    pub fn parse(member: &str) -> Self {
        match serde_json::from_str::<ItemRecord>(member) {
            Ok(record) => OutcomeEntry::Record(Box::new(record)),
            Err(_) => {
                tracing::warn!(member, "Outcome set member is not an item record");
                OutcomeEntry::Bare(member.to_string())
            }
        }
    }

    pub fn temp_msg_id(&self) -> &str {
        match self {
            OutcomeEntry::Record(record) => &record.temp_msg_id,
            OutcomeEntry::Bare(id) => id,
        }
    }

    pub fn fail_reason(&self) -> String {
        match self {
            OutcomeEntry::Record(record) => record.fail_reason.clone().unwrap_or_default(),
            OutcomeEntry::Bare(_) => String::new(),
        }
    }

    pub fn into_record(self) -> Option<ItemRecord> {
        match self {
            OutcomeEntry::Record(record) => Some(*record),
            OutcomeEntry::Bare(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> ItemMessage {
        ItemMessage {
            task_id: Uuid::new_v4(),
            temp_msg_id: "tmp-1".to_string(),
            order_id: 1,
            recipient: "union-1".to_string(),
            template_id: "tpl-abc".to_string(),
            url: Some("https://school.example/notice/1".to_string()),
            color: None,
            data: serde_json::json!({"first": {"value": "Exam tomorrow"}}),
            miniprogram: Some(MiniProgram {
                appid: "mini-1".to_string(),
                pagepath: "pages/notice".to_string(),
            }),
            account: AccountSnapshot {
                id: Uuid::new_v4(),
                app_id: "wx-app".to_string(),
                app_secret: "secret".to_string(),
            },
            callback_url: Some("/callback".to_string()),
        }
    }

    #[test]
    fn test_payload_uses_camel_case() {
        let json = serde_json::to_value(sample_message()).unwrap();
        assert!(json.get("tempMsgId").is_some());
        assert!(json.get("taskId").is_some());
        assert!(json["account"].get("appSecret").is_some());
    }

    #[test]
    fn test_failure_record() {
        let msg = sample_message();
        let task_id = msg.task_id;
        let record = msg.into_record(&DeliveryOutcome::Failure {
            reason: "timeout".to_string(),
        });
        assert_eq!(record.status, PushStatus::PushFailed);
        assert_eq!(record.fail_reason.as_deref(), Some("timeout"));
        assert_eq!(record.msg_id, None);
        assert_eq!(record.task_id, task_id);
        assert_eq!(record.miniprogram_pagepath.as_deref(), Some("pages/notice"));
    }

    #[test]
    fn test_outcome_entry_parses_records_and_bare_ids() {
        let record = sample_message().into_record(&DeliveryOutcome::Success {
            msg_id: "900".to_string(),
        });
        let member = serde_json::to_string(&record).unwrap();

        let parsed = OutcomeEntry::parse(&member);
        assert_eq!(parsed.temp_msg_id(), "tmp-1");
        assert_eq!(parsed.into_record(), Some(record));

        let bare = OutcomeEntry::parse("legacy-id");
        assert_eq!(bare.temp_msg_id(), "legacy-id");
        assert_eq!(bare.into_record(), None);
    }
}
