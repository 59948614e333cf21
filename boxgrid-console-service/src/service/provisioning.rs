use std::str::FromStr;
use std::sync::Arc;

use boxgrid_common::model::{NodeId, WorkerType};
use chrono::{DateTime, Utc};
use rand::RngCore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::model::{ProvisionedWorker, StoredCredential, WorkerNode};
use crate::repo::worker_node::{WorkerNodeRecord, WorkerNodeRepo};
use crate::repo::RepoError;
use crate::service::credential::WorkerCredentialService;

const PROVISION_ATTEMPTS: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid worker type: {0}")]
    InvalidWorkerType(String),
    #[error("A worker-sys already exists for owner {0}")]
    WorkerSysAlreadyExists(String),
    #[error("Internal: {0}")]
    Internal(String),
}

impl From<RepoError> for ProvisioningError {
    fn from(error: RepoError) -> Self {
        ProvisioningError::Internal(error.to_string())
    }
}

fn generate_worker_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Creation and deletion of worker identities: node row, owner labels,
/// credential, and the owner-claim row enforcing the worker-sys singleton.
pub struct WorkerProvisioningService {
    node_repo: Arc<dyn WorkerNodeRepo>,
    credentials: Arc<WorkerCredentialService>,
}

impl WorkerProvisioningService {
    pub fn new(
        node_repo: Arc<dyn WorkerNodeRepo>,
        credentials: Arc<WorkerCredentialService>,
    ) -> Self {
        Self {
            node_repo,
            credentials,
        }
    }

    pub async fn create(&self, now: DateTime<Utc>) -> Result<ProvisionedWorker, ProvisioningError> {
        self.create_internal("", WorkerType::Normal, now).await
    }

    pub async fn create_for_owner(
        &self,
        owner_id: &str,
        worker_type: &str,
        now: DateTime<Utc>,
    ) -> Result<ProvisionedWorker, ProvisioningError> {
        let owner_id = owner_id.trim();
        if owner_id.is_empty() {
            return Err(ProvisioningError::InvalidArgument(
                "owner_id must not be empty".to_string(),
            ));
        }
        let worker_type = WorkerType::from_str(worker_type)
            .map_err(|_| ProvisioningError::InvalidWorkerType(worker_type.to_string()))?;
        self.create_internal(owner_id, worker_type, now).await
    }

    async fn create_internal(
        &self,
        owner_id: &str,
        worker_type: WorkerType,
        now: DateTime<Utc>,
    ) -> Result<ProvisionedWorker, ProvisioningError> {
        if worker_type == WorkerType::Sys {
            // Cheap short-circuit; the claim row below is the real guard.
            let existing = self
                .node_repo
                .count_by_owner_and_type(owner_id, WorkerType::Sys.as_str())
                .await?;
            if existing > 0 {
                return Err(ProvisioningError::WorkerSysAlreadyExists(
                    owner_id.to_string(),
                ));
            }
        }

        for _ in 0..PROVISION_ATTEMPTS {
            let worker_id = NodeId::new(Uuid::new_v4().to_string());
            let worker_secret = generate_worker_secret();
            let record = self.node_record(&worker_id, owner_id, worker_type, now)?;
            if !self.node_repo.seed(&record).await? {
                // Node id collision; mint a new one.
                continue;
            }

            if worker_type == WorkerType::Sys {
                match self
                    .node_repo
                    .claim_sys_owner(owner_id, &worker_id.0, now.timestamp_millis())
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        self.node_repo.delete(&worker_id.0).await.ok();
                        return Err(ProvisioningError::WorkerSysAlreadyExists(
                            owner_id.to_string(),
                        ));
                    }
                    Err(err) => {
                        self.node_repo.delete(&worker_id.0).await.ok();
                        return Err(err.into());
                    }
                }
            }

            let credential = match self.credentials.hasher() {
                Some(hasher) => StoredCredential::Hashed {
                    hash: hasher.hash(&worker_secret),
                    algo: hasher.algo().to_string(),
                },
                None => StoredCredential::Plain {
                    secret: worker_secret.clone(),
                },
            };
            match self.credentials.put_if_absent(&worker_id, credential).await {
                Ok(true) => {
                    info!(%worker_id, %worker_type, owner_id, "Provisioned worker");
                    // The plaintext secret is emitted exactly once, here.
                    return Ok(ProvisionedWorker {
                        worker_id,
                        worker_secret,
                    });
                }
                Ok(false) => {
                    warn!(%worker_id, "Credential already present for fresh worker id");
                    self.rollback_seed(&worker_id, worker_type).await;
                }
                Err(err) => {
                    warn!(%worker_id, "Failed to install credential: {err}");
                    self.rollback_seed(&worker_id, worker_type).await;
                }
            }
        }
        Err(ProvisioningError::Internal(format!(
            "Failed to provision a worker within {PROVISION_ATTEMPTS} attempts"
        )))
    }

    async fn rollback_seed(&self, worker_id: &NodeId, worker_type: WorkerType) {
        self.node_repo.delete(&worker_id.0).await.ok();
        if worker_type == WorkerType::Sys {
            self.node_repo.delete_sys_owner_claim(&worker_id.0).await.ok();
        }
    }

    fn node_record(
        &self,
        worker_id: &NodeId,
        owner_id: &str,
        worker_type: WorkerType,
        now: DateTime<Utc>,
    ) -> Result<WorkerNodeRecord, ProvisioningError> {
        let labels = serde_json::json!({
            "source": "provisioned",
            "owner_id": owner_id,
            "worker_type": worker_type.as_str(),
        });
        Ok(WorkerNodeRecord {
            node_id: worker_id.0.clone(),
            session_id: None,
            name: worker_id.0.clone(),
            executor_kind: String::new(),
            labels: labels.to_string(),
            owner_id: owner_id.to_string(),
            worker_type: worker_type.as_str().to_string(),
            last_seen_ms: now.timestamp_millis(),
            created_ms: now.timestamp_millis(),
        })
    }

    /// Installs a config-declared worker identity idempotently at startup.
    pub async fn install_bootstrap_worker(
        &self,
        node_id: &str,
        secret: &str,
        owner_id: &str,
        worker_type: WorkerType,
        now: DateTime<Utc>,
    ) -> Result<(), ProvisioningError> {
        let node_id = node_id.trim();
        if node_id.is_empty() {
            return Err(ProvisioningError::InvalidArgument(
                "node_id must not be empty".to_string(),
            ));
        }
        let worker_id = NodeId::new(node_id);
        let labels = serde_json::json!({
            "source": "bootstrap",
            "owner_id": owner_id,
            "worker_type": worker_type.as_str(),
        });
        let record = WorkerNodeRecord {
            node_id: worker_id.0.clone(),
            session_id: None,
            name: worker_id.0.clone(),
            executor_kind: String::new(),
            labels: labels.to_string(),
            owner_id: owner_id.to_string(),
            worker_type: worker_type.as_str().to_string(),
            last_seen_ms: now.timestamp_millis(),
            created_ms: now.timestamp_millis(),
        };
        self.node_repo.seed(&record).await?;
        if worker_type == WorkerType::Sys {
            self.node_repo
                .claim_sys_owner(owner_id, &worker_id.0, now.timestamp_millis())
                .await?;
        }
        let credential = match self.credentials.hasher() {
            Some(hasher) => StoredCredential::Hashed {
                hash: hasher.hash(secret),
                algo: hasher.algo().to_string(),
            },
            None => StoredCredential::Plain {
                secret: secret.to_string(),
            },
        };
        self.credentials
            .put_if_absent(&worker_id, credential)
            .await?;
        Ok(())
    }

    /// Deletes the worker identity everywhere; a live session is evicted
    /// through the credential revocation path.
    pub async fn delete(&self, node_id: &NodeId) -> Result<(), ProvisioningError> {
        self.credentials.delete(node_id, "worker deleted").await?;
        self.node_repo.delete(&node_id.0).await?;
        self.node_repo.delete_sys_owner_claim(&node_id.0).await?;
        info!(%node_id, "Deleted provisioned worker");
        Ok(())
    }

    pub async fn get_node(
        &self,
        node_id: &NodeId,
    ) -> Result<Option<WorkerNode>, ProvisioningError> {
        let record = self.node_repo.get(&node_id.0).await?;
        record
            .map(WorkerNode::try_from)
            .transpose()
            .map_err(ProvisioningError::Internal)
    }

    /// Returns the stored credential form; used by the auth path and by
    /// operators inspecting a node.
    pub async fn get_worker_secret(
        &self,
        node_id: &NodeId,
    ) -> Result<Option<StoredCredential>, RepoError> {
        self.credentials.get(node_id).await
    }
}
