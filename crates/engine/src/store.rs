//! Persistent store: Task Records and Item Records, plus the account and
//! template lookups the planner needs.
//!
//! The store is the durable source of truth. Item Records are written by the
//! delivery worker on every path, which is what lets the reconciliation sweep
//! finish a task after the counter store lost its state.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use herald_common::error::AppError;
use herald_common::types::{
    Account, ItemRecord, PushStatus, TaskProgress, TaskRecord, TaskType, TemplateSetting,
};

/// Fields of a task at creation time.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub batch_count: i32,
    pub params: String,
    pub executor_id: Uuid,
    pub task_type: TaskType,
    pub is_delay: bool,
    pub plan_time: Option<DateTime<Utc>>,
    pub callback_url: Option<String>,
}

#[async_trait]
pub trait DispatchStore: Send + Sync {
    async fn find_account(&self, account_id: Uuid) -> Result<Option<Account>, AppError>;

    async fn find_template_setting(
        &self,
        app_id: &str,
        template_short_id: &str,
    ) -> Result<Option<TemplateSetting>, AppError>;

    /// Insert a task in the READY state.
    async fn create_task(&self, task: NewTask) -> Result<TaskRecord, AppError>;

    async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskRecord>, AppError>;

    async fn set_batch_count(&self, task_id: Uuid, batch_count: i32) -> Result<(), AppError>;

    /// Move a task from READY to COMPLETE.
    ///
    /// Returns `true` only for the single caller that performed the
    /// transition; every later call is a no-op returning `false`.
    async fn complete_task(&self, task_id: Uuid) -> Result<bool, AppError>;

    /// READY tasks whose effective start (plan time for deferred tasks,
    /// creation time otherwise) is older than `started_before`.
    async fn find_stale_ready(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>, AppError>;

    async fn insert_item(&self, item: &ItemRecord) -> Result<(), AppError>;

    /// Insert several items at once. Returns how many rows were written.
    async fn insert_items(&self, items: &[ItemRecord]) -> Result<u64, AppError>;

    /// Correlation ids already persisted for a task.
    async fn persisted_temp_msg_ids(&self, task_id: Uuid) -> Result<HashSet<String>, AppError>;

    async fn items_for_task(&self, task_id: Uuid) -> Result<Vec<ItemRecord>, AppError>;

    /// Record a provider receipt event against the item with `msg_id`.
    async fn mark_receipt(
        &self,
        msg_id: &str,
        status: PushStatus,
        reason: Option<&str>,
    ) -> Result<u64, AppError>;
}

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgDispatchStore {
    pool: PgPool,
}

impl PgDispatchStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DispatchStore for PgDispatchStore {
    async fn find_account(&self, account_id: Uuid) -> Result<Option<Account>, AppError> {
        let account: Option<Account> = sqlx::query_as(
            "SELECT id, app_id, app_secret, callback_url FROM accounts WHERE id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    async fn find_template_setting(
        &self,
        app_id: &str,
        template_short_id: &str,
    ) -> Result<Option<TemplateSetting>, AppError> {
        let setting: Option<TemplateSetting> = sqlx::query_as(
            r#"
            SELECT app_id, template_short_id, template_id
            FROM template_settings
            WHERE app_id = $1 AND template_short_id = $2
            "#,
        )
        .bind(app_id)
        .bind(template_short_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(setting)
    }

    async fn create_task(&self, task: NewTask) -> Result<TaskRecord, AppError> {
        let record: TaskRecord = sqlx::query_as(
            r#"
            INSERT INTO message_tasks
                (id, batch_count, params, executor_id, task_type, is_delay, plan_time, callback_url, progress)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(task.batch_count)
        .bind(&task.params)
        .bind(task.executor_id)
        .bind(task.task_type.to_string())
        .bind(task.is_delay)
        .bind(task.plan_time)
        .bind(&task.callback_url)
        .bind(TaskProgress::Ready.to_string())
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            task_id = %record.id,
            batch_count = record.batch_count,
            is_delay = record.is_delay,
            "Message task created"
        );

        Ok(record)
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskRecord>, AppError> {
        let task: Option<TaskRecord> = sqlx::query_as("SELECT * FROM message_tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(task)
    }

    async fn set_batch_count(&self, task_id: Uuid, batch_count: i32) -> Result<(), AppError> {
        sqlx::query("UPDATE message_tasks SET batch_count = $1, updated_at = NOW() WHERE id = $2")
            .bind(batch_count)
            .bind(task_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn complete_task(&self, task_id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE message_tasks
            SET progress = $1, updated_at = NOW()
            WHERE id = $2 AND progress = $3
            "#,
        )
        .bind(TaskProgress::Complete.to_string())
        .bind(task_id)
        .bind(TaskProgress::Ready.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_stale_ready(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>, AppError> {
        let tasks: Vec<TaskRecord> = sqlx::query_as(
            r#"
            SELECT *
            FROM message_tasks
            WHERE progress = $1
              AND COALESCE(plan_time, created_at) < $2
            ORDER BY created_at ASC
            "#,
        )
        .bind(TaskProgress::Ready.to_string())
        .bind(started_before)
        .fetch_all(&self.pool)
        .await?;

        Ok(tasks)
    }

    async fn insert_item(&self, item: &ItemRecord) -> Result<(), AppError> {
        self.insert_items(std::slice::from_ref(item)).await?;
        Ok(())
    }

    async fn insert_items(&self, items: &[ItemRecord]) -> Result<u64, AppError> {
        if items.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            r#"
            INSERT INTO message_items
                (id, msg_id, temp_msg_id, recipient, template_id, url, color, data,
                 miniprogram_app_id, miniprogram_pagepath, executor_id, task_id,
                 status, fail_reason, created_at)
            "#,
        );
        builder.push_values(items, |mut row, item| {
            row.push_bind(item.id)
                .push_bind(&item.msg_id)
                .push_bind(&item.temp_msg_id)
                .push_bind(&item.recipient)
                .push_bind(&item.template_id)
                .push_bind(&item.url)
                .push_bind(&item.color)
                .push_bind(&item.data)
                .push_bind(&item.miniprogram_app_id)
                .push_bind(&item.miniprogram_pagepath)
                .push_bind(item.executor_id)
                .push_bind(item.task_id)
                .push_bind(item.status.to_string())
                .push_bind(&item.fail_reason)
                .push_bind(item.created_at);
        });

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn persisted_temp_msg_ids(&self, task_id: Uuid) -> Result<HashSet<String>, AppError> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT temp_msg_id FROM message_items WHERE task_id = $1")
                .bind(task_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(ids.into_iter().collect())
    }

    async fn items_for_task(&self, task_id: Uuid) -> Result<Vec<ItemRecord>, AppError> {
        let items: Vec<ItemRecord> = sqlx::query_as(
            "SELECT * FROM message_items WHERE task_id = $1 ORDER BY created_at ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
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

        let result = sqlx::query(
            "UPDATE message_items SET status = $1, fail_reason = COALESCE($2, fail_reason) WHERE msg_id = $3",
        )
        .bind(status.to_string())
        .bind(reason)
        .bind(msg_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
