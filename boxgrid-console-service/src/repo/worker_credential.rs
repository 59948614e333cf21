use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Database, Pool};

use crate::model::{StoredCredential, CREDENTIAL_ALGO_PLAIN};
use crate::repo::RepoError;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct WorkerCredentialRecord {
    pub node_id: String,
    pub value: String,
    pub algo: String,
    pub created_ms: i64,
}

impl From<WorkerCredentialRecord> for StoredCredential {
    fn from(value: WorkerCredentialRecord) -> Self {
        if value.algo == CREDENTIAL_ALGO_PLAIN {
            StoredCredential::Plain {
                secret: value.value,
            }
        } else {
            StoredCredential::Hashed {
                hash: value.value,
                algo: value.algo,
            }
        }
    }
}

#[async_trait]
pub trait WorkerCredentialRepo: Send + Sync {
    /// Insert-if-absent; returns whether the row was created.
    async fn put_if_absent(&self, record: &WorkerCredentialRecord) -> Result<bool, RepoError>;

    async fn get(&self, node_id: &str) -> Result<Option<WorkerCredentialRecord>, RepoError>;

    async fn delete(&self, node_id: &str) -> Result<u64, RepoError>;
}

pub struct DbWorkerCredentialRepo<DB: Database> {
    db_pool: Arc<Pool<DB>>,
}

impl<DB: Database> DbWorkerCredentialRepo<DB> {
    pub fn new(db_pool: Arc<Pool<DB>>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl WorkerCredentialRepo for DbWorkerCredentialRepo<sqlx::Postgres> {
    async fn put_if_absent(&self, record: &WorkerCredentialRecord) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
              INSERT INTO worker_credentials (node_id, value, algo, created_ms)
              VALUES ($1, $2, $3, $4)
              ON CONFLICT (node_id) DO NOTHING
            "#,
        )
        .bind(record.node_id.clone())
        .bind(record.value.clone())
        .bind(record.algo.clone())
        .bind(record.created_ms)
        .execute(self.db_pool.deref())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, node_id: &str) -> Result<Option<WorkerCredentialRecord>, RepoError> {
        sqlx::query_as::<_, WorkerCredentialRecord>(
            "SELECT node_id, value, algo, created_ms FROM worker_credentials WHERE node_id = $1",
        )
        .bind(node_id)
        .fetch_optional(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn delete(&self, node_id: &str) -> Result<u64, RepoError> {
        let result = sqlx::query("DELETE FROM worker_credentials WHERE node_id = $1")
            .bind(node_id)
            .execute(self.db_pool.deref())
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl WorkerCredentialRepo for DbWorkerCredentialRepo<sqlx::Sqlite> {
    async fn put_if_absent(&self, record: &WorkerCredentialRecord) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
              INSERT INTO worker_credentials (node_id, value, algo, created_ms)
              VALUES ($1, $2, $3, $4)
              ON CONFLICT (node_id) DO NOTHING
            "#,
        )
        .bind(record.node_id.clone())
        .bind(record.value.clone())
        .bind(record.algo.clone())
        .bind(record.created_ms)
        .execute(self.db_pool.deref())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, node_id: &str) -> Result<Option<WorkerCredentialRecord>, RepoError> {
        sqlx::query_as::<_, WorkerCredentialRecord>(
            "SELECT node_id, value, algo, created_ms FROM worker_credentials WHERE node_id = $1",
        )
        .bind(node_id)
        .fetch_optional(self.db_pool.deref())
        .await
        .map_err(|e| e.into())
    }

    async fn delete(&self, node_id: &str) -> Result<u64, RepoError> {
        let result = sqlx::query("DELETE FROM worker_credentials WHERE node_id = $1")
            .bind(node_id)
            .execute(self.db_pool.deref())
            .await?;
        Ok(result.rows_affected())
    }
}
