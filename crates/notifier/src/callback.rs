//! Completion callback client.
//!
//! Posts a task's completion summary to the URL the requesting account
//! configured. Any transport failure, non-2xx status or empty body counts as a
//! failed callback; the caller decides what to do about it.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A recipient whose delivery ended in PUSH_FAILED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedEntry {
    pub msg_id: String,
    pub errmsg: String,
}

/// Aggregated outcome of a task, posted once the task completes.
///
/// `succeeded` lists correlation ids (`tempMsgId`) of delivered items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionSummary {
    pub task_id: Uuid,
    pub succeeded: Vec<String>,
    pub failed: Vec<FailedEntry>,
}

impl CompletionSummary {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("no callback URL configured")]
    MissingUrl,

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("callback answered with status {0}")]
    Status(u16),

    #[error("callback answered with an empty body")]
    EmptyBody,
}

/// Receives completion summaries.
#[async_trait]
pub trait CallbackSink: Send + Sync {
    async fn deliver(&self, url: &str, summary: &CompletionSummary) -> Result<(), CallbackError>;
}

/// HTTP POST callback client.
pub struct HttpCallbackClient {
    http: reqwest::Client,
    base_url: Option<String>,
}

impl HttpCallbackClient {
    pub fn new(base_url: Option<String>, timeout: Duration) -> Result<Self, CallbackError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.map(|b| b.trim_end_matches('/').to_string()),
        })
    }

    /// Absolute URLs are used as-is, relative paths are joined onto the
    /// configured base. Returns `None` when nothing usable remains.
    pub fn resolve_url(&self, url: &str) -> Option<String> {
        let url = url.trim();
        if url.is_empty() {
            return None;
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            return Some(url.to_string());
        }
        let base = self.base_url.as_ref()?;
        if url.starts_with('/') {
            Some(format!("{}{}", base, url))
        } else {
            Some(format!("{}/{}", base, url))
        }
    }
}

#[async_trait]
impl CallbackSink for HttpCallbackClient {
    async fn deliver(&self, url: &str, summary: &CompletionSummary) -> Result<(), CallbackError> {
        let target = self.resolve_url(url).ok_or(CallbackError::MissingUrl)?;

        let resp = self.http.post(&target).json(summary).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CallbackError::Status(status.as_u16()));
        }

        let body = resp.bytes().await?;
        if body.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(CallbackError::EmptyBody);
        }

        tracing::debug!(task_id = %summary.task_id, url = %target, "Completion callback delivered");
        Ok(())
    }
}
