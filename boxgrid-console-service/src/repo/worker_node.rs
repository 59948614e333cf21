use std::collections::HashMap;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use boxgrid_common::model::{NodeId, SessionId, WorkerType};
use chrono::DateTime;
use sqlx::{Database, Pool};

use crate::model::WorkerNode;
use crate::repo::RepoError;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct WorkerNodeRecord {
    pub node_id: String,
    pub session_id: Option<String>,
    pub name: String,
    pub executor_kind: String,
    pub labels: String,
    pub owner_id: String,
    pub worker_type: String,
    pub last_seen_ms: i64,
    pub created_ms: i64,
}

impl TryFrom<WorkerNodeRecord> for WorkerNode {
    type Error = String;

    fn try_from(value: WorkerNodeRecord) -> Result<Self, Self::Error> {
        let labels: HashMap<String, String> = serde_json::from_str(&value.labels)
            .map_err(|e| format!("Invalid worker labels: {e}"))?;
        let session_id = value
            .session_id
            .map(|raw| SessionId::from_str(&raw).map_err(|e| format!("Invalid session id: {e}")))
            .transpose()?;
        let worker_type = WorkerType::from_str(&value.worker_type)?;
        Ok(WorkerNode {
            node_id: NodeId::new(value.node_id),
            session_id,
            name: value.name,
            executor_kind: value.executor_kind,
            labels,
            owner_id: value.owner_id,
            worker_type,
            last_seen: DateTime::from_timestamp_millis(value.last_seen_ms)
                .ok_or("Invalid last_seen timestamp")?,
            created_at: DateTime::from_timestamp_millis(value.created_ms)
                .ok_or("Invalid created timestamp")?,
        })
    }
}

/// Outcome of a conditional heartbeat touch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatTouch {
    Touched,
    UnknownNode,
    /// A newer session already took over the node row.
    SessionMismatch,
}

#[async_trait]
pub trait WorkerNodeRepo: Send + Sync {
    /// Insert-if-absent; returns whether the row was created.
    async fn seed(&self, record: &WorkerNodeRecord) -> Result<bool, RepoError>;

    /// Install the session fields for a node, creating the row if needed.
    async fn upsert_session(&self, record: &WorkerNodeRecord) -> Result<(), RepoError>;

    async fn get(&self, node_id: &str) -> Result<Option<WorkerNodeRecord>, RepoError>;

    async fn touch(
        &self,
        node_id: &str,
        session_id: &str,
        now_ms: i64,
    ) -> Result<HeartbeatTouch, RepoError>;

    /// Clears the session column only when it still holds `session_id`.
    async fn clear_session(&self, node_id: &str, session_id: &str) -> Result<u64, RepoError>;

    async fn delete(&self, node_id: &str) -> Result<u64, RepoError>;

    async fn count_by_owner_and_type(
        &self,
        owner_id: &str,
        worker_type: &str,
    ) -> Result<u64, RepoError>;

    /// Compare-and-set owner claim used for the worker-sys singleton.
    async fn claim_sys_owner(
        &self,
        owner_id: &str,
        node_id: &str,
        now_ms: i64,
    ) -> Result<bool, RepoError>;

    async fn delete_sys_owner_claim(&self, node_id: &str) -> Result<u64, RepoError>;
}

pub struct DbWorkerNodeRepo<DB: Database> {
    db_pool: Arc<Pool<DB>>,
}

impl<DB: Database> DbWorkerNodeRepo<DB> {
    pub fn new(db_pool: Arc<Pool<DB>>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl WorkerNodeRepo for DbWorkerNodeRepo<sqlx::Postgres> {
    async fn seed(&self, record: &WorkerNodeRecord) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
              INSERT INTO worker_nodes
                (node_id, session_id, name, executor_kind, labels, owner_id, worker_type, last_seen_ms, created_ms)
              VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9)
              ON CONFLICT (node_id) DO NOTHING
            "#,
        )
        .bind(record.node_id.clone())
        .bind(record.session_id.clone())
        .bind(record.name.clone())
        .bind(record.executor_kind.clone())
        .bind(record.labels.clone())
        .bind(record.owner_id.clone())
        .bind(record.worker_type.clone())
        .bind(record.last_seen_ms)
        .bind(record.created_ms)
        .execute(self.db_pool.deref())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_session(&self, record: &WorkerNodeRecord) -> Result<(), RepoError> {
        sqlx::query(
            r#"
              INSERT INTO worker_nodes
                (node_id, session_id, name, executor_kind, labels, owner_id, worker_type, last_seen_ms, created_ms)
              VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9)
              ON CONFLICT (node_id) DO UPDATE
              SET session_id = $2,
                  name = $3,
                  executor_kind = $4,
                  labels = $5,
                  last_seen_ms = $8
            "#,
        )
        .bind(record.node_id.clone())
        .bind(record.session_id.clone())
        .bind(record.name.clone())
        .bind(record.executor_kind.clone())
        .bind(record.labels.clone())
        .bind(record.owner_id.clone())
        .bind(record.worker_type.clone())
        .bind(record.last_seen_ms)
        .bind(record.created_ms)
        .execute(self.db_pool.deref())
        .await?;
        Ok(())
    }

    async fn get(&self, node_id: &str) -> Result<Option<WorkerNodeRecord>, RepoError> {
        sqlx::query_as::<_, WorkerNodeRecord>(
            "SELECT node_id, session_id, name, executor_kind, labels, owner_id, worker_type, last_seen_ms, created_ms FROM worker_nodes WHERE node_id = $1",
        )
        .bind(node_id)
        .fetch_optional(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn touch(
        &self,
        node_id: &str,
        session_id: &str,
        now_ms: i64,
    ) -> Result<HeartbeatTouch, RepoError> {
        let result = sqlx::query(
            "UPDATE worker_nodes SET last_seen_ms = $3 WHERE node_id = $1 AND session_id = $2",
        )
        .bind(node_id)
        .bind(session_id)
        .bind(now_ms)
        .execute(self.db_pool.deref())
        .await?;
        if result.rows_affected() > 0 {
            return Ok(HeartbeatTouch::Touched);
        }
        let exists = sqlx::query("SELECT node_id FROM worker_nodes WHERE node_id = $1")
            .bind(node_id)
            .fetch_optional(self.db_pool.deref())
            .await?;
        if exists.is_some() {
            Ok(HeartbeatTouch::SessionMismatch)
        } else {
            Ok(HeartbeatTouch::UnknownNode)
        }
    }

    async fn clear_session(&self, node_id: &str, session_id: &str) -> Result<u64, RepoError> {
        let result = sqlx::query(
            "UPDATE worker_nodes SET session_id = NULL WHERE node_id = $1 AND session_id = $2",
        )
        .bind(node_id)
        .bind(session_id)
        .execute(self.db_pool.deref())
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, node_id: &str) -> Result<u64, RepoError> {
        let result = sqlx::query("DELETE FROM worker_nodes WHERE node_id = $1")
            .bind(node_id)
            .execute(self.db_pool.deref())
            .await?;
        Ok(result.rows_affected())
    }

    async fn count_by_owner_and_type(
        &self,
        owner_id: &str,
        worker_type: &str,
    ) -> Result<u64, RepoError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM worker_nodes WHERE owner_id = $1 AND worker_type = $2",
        )
        .bind(owner_id)
        .bind(worker_type)
        .fetch_one(self.db_pool.deref())
        .await?;
        Ok(count as u64)
    }

    async fn claim_sys_owner(
        &self,
        owner_id: &str,
        node_id: &str,
        now_ms: i64,
    ) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
              INSERT INTO worker_sys_owners (owner_id, node_id, created_ms)
              VALUES ($1, $2, $3)
              ON CONFLICT (owner_id) DO NOTHING
            "#,
        )
        .bind(owner_id)
        .bind(node_id)
        .bind(now_ms)
        .execute(self.db_pool.deref())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_sys_owner_claim(&self, node_id: &str) -> Result<u64, RepoError> {
        let result = sqlx::query("DELETE FROM worker_sys_owners WHERE node_id = $1")
            .bind(node_id)
            .execute(self.db_pool.deref())
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl WorkerNodeRepo for DbWorkerNodeRepo<sqlx::Sqlite> {
    async fn seed(&self, record: &WorkerNodeRecord) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
              INSERT INTO worker_nodes
                (node_id, session_id, name, executor_kind, labels, owner_id, worker_type, last_seen_ms, created_ms)
              VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9)
              ON CONFLICT (node_id) DO NOTHING
            "#,
        )
        .bind(record.node_id.clone())
        .bind(record.session_id.clone())
        .bind(record.name.clone())
        .bind(record.executor_kind.clone())
        .bind(record.labels.clone())
        .bind(record.owner_id.clone())
        .bind(record.worker_type.clone())
        .bind(record.last_seen_ms)
        .bind(record.created_ms)
        .execute(self.db_pool.deref())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_session(&self, record: &WorkerNodeRecord) -> Result<(), RepoError> {
        sqlx::query(
            r#"
              INSERT INTO worker_nodes
                (node_id, session_id, name, executor_kind, labels, owner_id, worker_type, last_seen_ms, created_ms)
              VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9)
              ON CONFLICT (node_id) DO UPDATE
              SET session_id = $2,
                  name = $3,
                  executor_kind = $4,
                  labels = $5,
                  last_seen_ms = $8
            "#,
        )
        .bind(record.node_id.clone())
        .bind(record.session_id.clone())
        .bind(record.name.clone())
        .bind(record.executor_kind.clone())
        .bind(record.labels.clone())
        .bind(record.owner_id.clone())
        .bind(record.worker_type.clone())
        .bind(record.last_seen_ms)
        .bind(record.created_ms)
        .execute(self.db_pool.deref())
        .await?;
        Ok(())
    }

    async fn get(&self, node_id: &str) -> Result<Option<WorkerNodeRecord>, RepoError> {
        sqlx::query_as::<_, WorkerNodeRecord>(
            "SELECT node_id, session_id, name, executor_kind, labels, owner_id, worker_type, last_seen_ms, created_ms FROM worker_nodes WHERE node_id = $1",
        )
        .bind(node_id)
        .fetch_optional(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn touch(
        &self,
        node_id: &str,
        session_id: &str,
        now_ms: i64,
    ) -> Result<HeartbeatTouch, RepoError> {
        let result = sqlx::query(
            "UPDATE worker_nodes SET last_seen_ms = $3 WHERE node_id = $1 AND session_id = $2",
        )
        .bind(node_id)
        .bind(session_id)
        .bind(now_ms)
        .execute(self.db_pool.deref())
        .await?;
        if result.rows_affected() > 0 {
            return Ok(HeartbeatTouch::Touched);
        }
        let exists = sqlx::query("SELECT node_id FROM worker_nodes WHERE node_id = $1")
            .bind(node_id)
            .fetch_optional(self.db_pool.deref())
            .await?;
        if exists.is_some() {
            Ok(HeartbeatTouch::SessionMismatch)
        } else {
            Ok(HeartbeatTouch::UnknownNode)
        }
    }

    async fn clear_session(&self, node_id: &str, session_id: &str) -> Result<u64, RepoError> {
        let result = sqlx::query(
            "UPDATE worker_nodes SET session_id = NULL WHERE node_id = $1 AND session_id = $2",
        )
        .bind(node_id)
        .bind(session_id)
        .execute(self.db_pool.deref())
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, node_id: &str) -> Result<u64, RepoError> {
        let result = sqlx::query("DELETE FROM worker_nodes WHERE node_id = $1")
            .bind(node_id)
            .execute(self.db_pool.deref())
            .await?;
        Ok(result.rows_affected())
    }

    async fn count_by_owner_and_type(
        &self,
        owner_id: &str,
        worker_type: &str,
    ) -> Result<u64, RepoError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM worker_nodes WHERE owner_id = $1 AND worker_type = $2",
        )
        .bind(owner_id)
        .bind(worker_type)
        .fetch_one(self.db_pool.deref())
        .await?;
        Ok(count as u64)
    }

    async fn claim_sys_owner(
        &self,
        owner_id: &str,
        node_id: &str,
        now_ms: i64,
    ) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
              INSERT INTO worker_sys_owners (owner_id, node_id, created_ms)
              VALUES ($1, $2, $3)
              ON CONFLICT (owner_id) DO NOTHING
            "#,
        )
        .bind(owner_id)
        .bind(node_id)
        .bind(now_ms)
        .execute(self.db_pool.deref())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_sys_owner_claim(&self, node_id: &str) -> Result<u64, RepoError> {
        let result = sqlx::query("DELETE FROM worker_sys_owners WHERE node_id = $1")
            .bind(node_id)
            .execute(self.db_pool.deref())
            .await?;
        Ok(result.rows_affected())
    }
}
