use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a dispatch task. Moves from `Ready` to `Complete` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskProgress {
    Ready,
    Complete,
}

impl std::fmt::Display for TaskProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskProgress::Ready => write!(f, "ready"),
            TaskProgress::Complete => write!(f, "complete"),
        }
    }
}

/// Kind of dispatch a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Default,
    Templated,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::Default => write!(f, "default"),
            TaskType::Templated => write!(f, "templated"),
        }
    }
}

/// Per-recipient delivery status.
///
/// `Default` and the `Push*` states are written by the delivery worker. The
/// `Receive*` states come later from the provider's own receipt events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PushStatus {
    Default,
    PushSuccess,
    PushFailed,
    ReceiveSuccess,
    ReceiveFailed,
}

impl std::fmt::Display for PushStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PushStatus::Default => write!(f, "default"),
            PushStatus::PushSuccess => write!(f, "push_success"),
            PushStatus::PushFailed => write!(f, "push_failed"),
            PushStatus::ReceiveSuccess => write!(f, "receive_success"),
            PushStatus::ReceiveFailed => write!(f, "receive_failed"),
        }
    }
}

/// One batch dispatch request and its lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskRecord {
    pub id: Uuid,
    /// Number of items the task waits for
    pub batch_count: i32,
    /// Serialized original request, kept for audit and recovery
    pub params: String,
    /// Account that issued the request
    pub executor_id: Uuid,
    pub task_type: TaskType,
    pub is_delay: bool,
    /// Scheduled send time, present iff `is_delay`
    pub plan_time: Option<DateTime<Utc>>,
    /// Where the completion summary is posted
    pub callback_url: Option<String>,
    pub progress: TaskProgress,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn is_complete(&self) -> bool {
        self.progress == TaskProgress::Complete
    }
}

/// Durable outcome of one recipient's delivery.
///
/// The same shape is serialized into the task's ephemeral outcome sets, which
/// lets the reconciliation sweep insert records straight from the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ItemRecord {
    pub id: Uuid,
    /// Provider-assigned id, set once delivery succeeded
    pub msg_id: Option<String>,
    /// Correlation id generated at publish time, unique per item
    pub temp_msg_id: String,
    pub recipient: String,
    pub template_id: String,
    pub url: Option<String>,
    pub color: Option<String>,
    pub data: serde_json::Value,
    pub miniprogram_app_id: Option<String>,
    pub miniprogram_pagepath: Option<String>,
    pub executor_id: Uuid,
    pub task_id: Uuid,
    pub status: PushStatus,
    pub fail_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A sending account: provider credentials plus callback routing.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: Uuid,
    pub app_id: String,
    pub app_secret: String,
    pub callback_url: Option<String>,
}

/// Maps a short template reference to the provider template id for one account.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TemplateSetting {
    pub app_id: String,
    pub template_short_id: String,
    pub template_id: String,
}
