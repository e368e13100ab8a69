//! Scriptable collaborators and fixtures for exercising the pipeline without
//! a provider or callback endpoint.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use uuid::Uuid;

use herald_common::types::{Account, TaskType, TemplateSetting};
use herald_notifier::callback::{CallbackError, CallbackSink, CompletionSummary};
use herald_notifier::provider::{Credentials, NotificationProvider, ProviderError, TemplateMessage};

use crate::store::NewTask;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Provider whose answers are scripted per recipient.
#[derive(Default)]
pub struct ScriptedProvider {
    /// Remaining failures per recipient
    failures: Mutex<HashMap<String, usize>>,
    attempts: Mutex<HashMap<String, usize>>,
    next_id: AtomicU64,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send to `recipient` is rejected.
    pub fn fail_always(&self, recipient: &str) {
        self.fail_times(recipient, usize::MAX);
    }

    /// The next `n` sends to `recipient` are rejected.
    pub fn fail_times(&self, recipient: &str, n: usize) {
        lock(&self.failures).insert(recipient.to_string(), n);
    }

    pub fn attempts(&self, recipient: &str) -> usize {
        lock(&self.attempts).get(recipient).copied().unwrap_or(0)
    }

    pub fn total_attempts(&self) -> usize {
        lock(&self.attempts).values().sum()
    }
}

#[async_trait]
impl NotificationProvider for ScriptedProvider {
    async fn send(
        &self,
        _credentials: &Credentials,
        message: &TemplateMessage,
    ) -> Result<String, ProviderError> {
        *lock(&self.attempts).entry(message.touser.clone()).or_default() += 1;

        let mut failures = lock(&self.failures);
        if let Some(left) = failures.get_mut(&message.touser) {
            if *left > 0 {
                *left = left.saturating_sub(1);
                return Err(ProviderError::Rejected {
                    code: 43004,
                    message: "require subscribe".to_string(),
                });
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("msg-{}", id))
    }
}

/// Callback sink that records every call.
pub struct RecordingCallback {
    fail: bool,
    calls: Mutex<Vec<(String, CompletionSummary)>>,
}

impl RecordingCallback {
    pub fn ok() -> Self {
        Self {
            fail: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answers every call as an unreachable endpoint would.
    pub fn failing() -> Self {
        Self {
            fail: true,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, CompletionSummary)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl CallbackSink for RecordingCallback {
    async fn deliver(&self, url: &str, summary: &CompletionSummary) -> Result<(), CallbackError> {
        lock(&self.calls).push((url.to_string(), summary.clone()));
        if self.fail {
            return Err(CallbackError::Status(503));
        }
        Ok(())
    }
}

pub fn sample_account() -> Account {
    Account {
        id: Uuid::new_v4(),
        app_id: "wx-school".to_string(),
        app_secret: "s3cret".to_string(),
        callback_url: Some("/hooks/notice-done".to_string()),
    }
}

/// Maps short id `notice` to provider template `tpl-notice` for `account`.
pub fn sample_template(account: &Account) -> TemplateSetting {
    TemplateSetting {
        app_id: account.app_id.clone(),
        template_short_id: "notice".to_string(),
        template_id: "tpl-notice".to_string(),
    }
}

pub fn new_task(batch_count: i32, callback_url: Option<&str>) -> NewTask {
    NewTask {
        batch_count,
        params: "{}".to_string(),
        executor_id: Uuid::new_v4(),
        task_type: TaskType::Templated,
        is_delay: false,
        plan_time: None,
        callback_url: callback_url.map(str::to_string),
    }
}
