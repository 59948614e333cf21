use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use boxgrid_common::model::{CommandId, TaskId, TaskStatus};
use chrono::DateTime;
use sqlx::{Database, Pool};

use crate::model::Task;
use crate::repo::RepoError;

// Kept in sync with TaskStatus::is_terminal; used by the conditional
// transition queries below.
const NON_TERMINAL_STATUS: &str = "('queued', 'dispatched', 'running')";

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct TaskRecord {
    pub task_id: String,
    pub owner_id: String,
    pub request_id: Option<String>,
    pub capability: String,
    pub status: String,
    pub command_id: Option<String>,
    pub input_json: String,
    pub result_json: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_ms: i64,
    pub updated_ms: i64,
    pub deadline_ms: i64,
    pub completed_ms: Option<i64>,
    pub expires_ms: Option<i64>,
}

impl TryFrom<TaskRecord> for Task {
    type Error = String;

    fn try_from(value: TaskRecord) -> Result<Self, Self::Error> {
        let task_id = TaskId::from_str(&value.task_id).map_err(|e| format!("Invalid task id: {e}"))?;
        let command_id = value
            .command_id
            .map(|raw| CommandId::from_str(&raw).map_err(|e| format!("Invalid command id: {e}")))
            .transpose()?;
        let status = TaskStatus::from_str(&value.status)?;
        Ok(Task {
            task_id,
            owner_id: value.owner_id,
            request_id: value.request_id,
            command_id,
            capability: value.capability,
            status,
            input_json: value.input_json,
            result_json: value.result_json,
            error_code: value.error_code,
            error_message: value.error_message,
            created_at: DateTime::from_timestamp_millis(value.created_ms)
                .ok_or("Invalid created timestamp")?,
            updated_at: DateTime::from_timestamp_millis(value.updated_ms)
                .ok_or("Invalid updated timestamp")?,
            deadline_at: DateTime::from_timestamp_millis(value.deadline_ms)
                .ok_or("Invalid deadline timestamp")?,
            completed_at: value.completed_ms.and_then(DateTime::from_timestamp_millis),
            expires_at: value.expires_ms.and_then(DateTime::from_timestamp_millis),
        })
    }
}

#[async_trait]
pub trait TaskRepo: Send + Sync {
    /// Insert a fresh queued row. Returns false when the insert conflicted
    /// with an existing row (same task id, or the partial unique index on
    /// `(owner_id, request_id)`).
    async fn insert(&self, record: &TaskRecord) -> Result<bool, RepoError>;

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, RepoError>;

    async fn get_by_request(
        &self,
        owner_id: &str,
        request_id: &str,
    ) -> Result<Option<TaskRecord>, RepoError>;

    /// Conditional `any non-terminal -> dispatched`; returns affected rows.
    async fn mark_dispatched(&self, task_id: &str, now_ms: i64) -> Result<u64, RepoError>;

    /// Conditional `queued|dispatched -> running`; returns affected rows.
    async fn mark_running(
        &self,
        task_id: &str,
        command_id: &str,
        now_ms: i64,
    ) -> Result<u64, RepoError>;

    /// Conditional terminal transition; zero rows means the task already
    /// reached a terminal state.
    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        task_id: &str,
        status: &str,
        result_json: Option<&str>,
        error_code: Option<&str>,
        error_message: Option<&str>,
        completed_ms: i64,
        expires_ms: i64,
        now_ms: i64,
    ) -> Result<u64, RepoError>;

    async fn prune_expired(&self, now_ms: i64) -> Result<u64, RepoError>;
}

pub struct DbTaskRepo<DB: Database> {
    db_pool: Arc<Pool<DB>>,
}

impl<DB: Database> DbTaskRepo<DB> {
    pub fn new(db_pool: Arc<Pool<DB>>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl TaskRepo for DbTaskRepo<sqlx::Postgres> {
    async fn insert(&self, record: &TaskRecord) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
              INSERT INTO tasks
                (task_id, owner_id, request_id, capability, status, command_id,
                 input_json, result_json, error_code, error_message,
                 created_ms, updated_ms, deadline_ms, completed_ms, expires_ms)
              VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
              ON CONFLICT DO NOTHING
            "#,
        )
        .bind(record.task_id.clone())
        .bind(record.owner_id.clone())
        .bind(record.request_id.clone())
        .bind(record.capability.clone())
        .bind(record.status.clone())
        .bind(record.command_id.clone())
        .bind(record.input_json.clone())
        .bind(record.result_json.clone())
        .bind(record.error_code.clone())
        .bind(record.error_message.clone())
        .bind(record.created_ms)
        .bind(record.updated_ms)
        .bind(record.deadline_ms)
        .bind(record.completed_ms)
        .bind(record.expires_ms)
        .execute(self.db_pool.deref())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, RepoError> {
        sqlx::query_as::<_, TaskRecord>("SELECT * FROM tasks WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn get_by_request(
        &self,
        owner_id: &str,
        request_id: &str,
    ) -> Result<Option<TaskRecord>, RepoError> {
        sqlx::query_as::<_, TaskRecord>(
            "SELECT * FROM tasks WHERE owner_id = $1 AND request_id = $2",
        )
        .bind(owner_id)
        .bind(request_id)
        .fetch_optional(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn mark_dispatched(&self, task_id: &str, now_ms: i64) -> Result<u64, RepoError> {
        let result = sqlx::query(&format!(
            "UPDATE tasks SET status = 'dispatched', updated_ms = $2 \
             WHERE task_id = $1 AND status IN {NON_TERMINAL_STATUS}"
        ))
        .bind(task_id)
        .bind(now_ms)
        .execute(self.db_pool.deref())
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_running(
        &self,
        task_id: &str,
        command_id: &str,
        now_ms: i64,
    ) -> Result<u64, RepoError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'running', command_id = $2, updated_ms = $3 \
             WHERE task_id = $1 AND status IN ('queued', 'dispatched')",
        )
        .bind(task_id)
        .bind(command_id)
        .bind(now_ms)
        .execute(self.db_pool.deref())
        .await?;
        Ok(result.rows_affected())
    }

    async fn finish(
        &self,
        task_id: &str,
        status: &str,
        result_json: Option<&str>,
        error_code: Option<&str>,
        error_message: Option<&str>,
        completed_ms: i64,
        expires_ms: i64,
        now_ms: i64,
    ) -> Result<u64, RepoError> {
        let result = sqlx::query(&format!(
            "UPDATE tasks SET status = $2, result_json = $3, error_code = $4, \
             error_message = $5, completed_ms = $6, expires_ms = $7, updated_ms = $8 \
             WHERE task_id = $1 AND status IN {NON_TERMINAL_STATUS}"
        ))
        .bind(task_id)
        .bind(status)
        .bind(result_json)
        .bind(error_code)
        .bind(error_message)
        .bind(completed_ms)
        .bind(expires_ms)
        .bind(now_ms)
        .execute(self.db_pool.deref())
        .await?;
        Ok(result.rows_affected())
    }

    async fn prune_expired(&self, now_ms: i64) -> Result<u64, RepoError> {
        let result = sqlx::query(
            "DELETE FROM tasks WHERE expires_ms IS NOT NULL AND expires_ms <= $1",
        )
        .bind(now_ms)
        .execute(self.db_pool.deref())
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TaskRepo for DbTaskRepo<sqlx::Sqlite> {
    async fn insert(&self, record: &TaskRecord) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
              INSERT INTO tasks
                (task_id, owner_id, request_id, capability, status, command_id,
                 input_json, result_json, error_code, error_message,
                 created_ms, updated_ms, deadline_ms, completed_ms, expires_ms)
              VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
              ON CONFLICT DO NOTHING
            "#,
        )
        .bind(record.task_id.clone())
        .bind(record.owner_id.clone())
        .bind(record.request_id.clone())
        .bind(record.capability.clone())
        .bind(record.status.clone())
        .bind(record.command_id.clone())
        .bind(record.input_json.clone())
        .bind(record.result_json.clone())
        .bind(record.error_code.clone())
        .bind(record.error_message.clone())
        .bind(record.created_ms)
        .bind(record.updated_ms)
        .bind(record.deadline_ms)
        .bind(record.completed_ms)
        .bind(record.expires_ms)
        .execute(self.db_pool.deref())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, RepoError> {
        sqlx::query_as::<_, TaskRecord>("SELECT * FROM tasks WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(self.db_pool.deref())
            .await
            .map_err(|e| e.into())
    }

    async fn get_by_request(
        &self,
        owner_id: &str,
        request_id: &str,
    ) -> Result<Option<TaskRecord>, RepoError> {
        sqlx::query_as::<_, TaskRecord>(
            "SELECT * FROM tasks WHERE owner_id = $1 AND request_id = $2",
        )
        .bind(owner_id)
        .bind(request_id)
        .fetch_optional(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn mark_dispatched(&self, task_id: &str, now_ms: i64) -> Result<u64, RepoError> {
        let result = sqlx::query(&format!(
            "UPDATE tasks SET status = 'dispatched', updated_ms = $2 \
             WHERE task_id = $1 AND status IN {NON_TERMINAL_STATUS}"
        ))
        .bind(task_id)
        .bind(now_ms)
        .execute(self.db_pool.deref())
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_running(
        &self,
        task_id: &str,
        command_id: &str,
        now_ms: i64,
    ) -> Result<u64, RepoError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'running', command_id = $2, updated_ms = $3 \
             WHERE task_id = $1 AND status IN ('queued', 'dispatched')",
        )
        .bind(task_id)
        .bind(command_id)
        .bind(now_ms)
        .execute(self.db_pool.deref())
        .await?;
        Ok(result.rows_affected())
    }

    async fn finish(
        &self,
        task_id: &str,
        status: &str,
        result_json: Option<&str>,
        error_code: Option<&str>,
        error_message: Option<&str>,
        completed_ms: i64,
        expires_ms: i64,
        now_ms: i64,
    ) -> Result<u64, RepoError> {
        let result = sqlx::query(&format!(
            "UPDATE tasks SET status = $2, result_json = $3, error_code = $4, \
             error_message = $5, completed_ms = $6, expires_ms = $7, updated_ms = $8 \
             WHERE task_id = $1 AND status IN {NON_TERMINAL_STATUS}"
        ))
        .bind(task_id)
        .bind(status)
        .bind(result_json)
        .bind(error_code)
        .bind(error_message)
        .bind(completed_ms)
        .bind(expires_ms)
        .bind(now_ms)
        .execute(self.db_pool.deref())
        .await?;
        Ok(result.rows_affected())
    }

    async fn prune_expired(&self, now_ms: i64) -> Result<u64, RepoError> {
        let result = sqlx::query(
            "DELETE FROM tasks WHERE expires_ms IS NOT NULL AND expires_ms <= $1",
        )
        .bind(now_ms)
        .execute(self.db_pool.deref())
        .await?;
        Ok(result.rows_affected())
    }
}
