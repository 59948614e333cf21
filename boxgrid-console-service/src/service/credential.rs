use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use boxgrid_common::model::NodeId;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::info;

use crate::model::{StoredCredential, CREDENTIAL_ALGO_HMAC_SHA256, CREDENTIAL_ALGO_PLAIN};
use crate::repo::worker_credential::{WorkerCredentialRecord, WorkerCredentialRepo};
use crate::repo::RepoError;
use crate::service::session::{LazySessionDisconnect, SessionError};

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 secret hashing under a server-side key.
#[derive(Clone)]
pub struct SecretHasher {
    key: Vec<u8>,
}

impl SecretHasher {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    pub fn algo(&self) -> &'static str {
        CREDENTIAL_ALGO_HMAC_SHA256
    }

    pub fn hash(&self, secret: &str) -> String {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.key) else {
            // HMAC accepts keys of any length; this arm is unreachable.
            return String::new();
        };
        mac.update(secret.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time comparison of a stored hash against a presented
    /// secret, via the Mac verifier.
    pub fn equal(&self, stored_hash_hex: &str, presented_secret: &str) -> bool {
        let Ok(expected) = hex::decode(stored_hash_hex) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.key) else {
            return false;
        };
        mac.update(presented_secret.as_bytes());
        mac.verify_slice(&expected).is_ok()
    }
}

/// Constant-time byte comparison for plain stored secrets.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// In-memory credential map over the persisted table. Reads fall through
/// to the table on miss and cache the stored form.
pub struct WorkerCredentialService {
    cache: Mutex<HashMap<NodeId, StoredCredential>>,
    repo: Arc<dyn WorkerCredentialRepo>,
    hasher: Option<SecretHasher>,
    disconnect: LazySessionDisconnect,
}

impl WorkerCredentialService {
    pub fn new(
        repo: Arc<dyn WorkerCredentialRepo>,
        hasher: Option<SecretHasher>,
        disconnect: LazySessionDisconnect,
    ) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            repo,
            hasher,
            disconnect,
        }
    }

    pub fn hasher(&self) -> Option<&SecretHasher> {
        self.hasher.as_ref()
    }

    pub async fn get(&self, node_id: &NodeId) -> Result<Option<StoredCredential>, RepoError> {
        if let Some(credential) = self.cache.lock().unwrap().get(node_id) {
            return Ok(Some(credential.clone()));
        }
        let record = self.repo.get(&node_id.0).await?;
        match record {
            Some(record) => {
                let credential: StoredCredential = record.into();
                self.cache
                    .lock()
                    .unwrap()
                    .insert(node_id.clone(), credential.clone());
                Ok(Some(credential))
            }
            None => Ok(None),
        }
    }

    /// Authentication check for the hello path.
    pub async fn verify(
        &self,
        node_id: &NodeId,
        presented_secret: &str,
    ) -> Result<(), SessionError> {
        let stored = self
            .get(node_id)
            .await
            .map_err(|err| SessionError::Internal(format!("Failed to load credential: {err}")))?;
        let Some(stored) = stored else {
            return Err(SessionError::Unauthenticated(format!(
                "Unknown node: {node_id}"
            )));
        };
        let matches = match &stored {
            StoredCredential::Plain { secret } => {
                constant_time_eq(secret.as_bytes(), presented_secret.as_bytes())
            }
            StoredCredential::Hashed { hash, algo } if algo == CREDENTIAL_ALGO_HMAC_SHA256 => self
                .hasher
                .as_ref()
                .is_some_and(|hasher| hasher.equal(hash, presented_secret)),
            StoredCredential::Hashed { .. } => false,
        };
        if matches {
            Ok(())
        } else {
            Err(SessionError::Unauthenticated(
                "Invalid worker secret".to_string(),
            ))
        }
    }

    /// Atomic put-if-absent at both the in-memory map and the persisted
    /// table.
    pub async fn put_if_absent(
        &self,
        node_id: &NodeId,
        credential: StoredCredential,
    ) -> Result<bool, RepoError> {
        {
            let mut cache = self.cache.lock().unwrap();
            if cache.contains_key(node_id) {
                return Ok(false);
            }
            cache.insert(node_id.clone(), credential.clone());
        }
        let (value, algo) = match credential {
            StoredCredential::Plain { secret } => (secret, CREDENTIAL_ALGO_PLAIN.to_string()),
            StoredCredential::Hashed { hash, algo } => (hash, algo),
        };
        let record = WorkerCredentialRecord {
            node_id: node_id.0.clone(),
            value,
            algo,
            created_ms: Utc::now().timestamp_millis(),
        };
        match self.repo.put_if_absent(&record).await {
            Ok(true) => Ok(true),
            Ok(false) => {
                // A persisted credential already existed; drop the cached
                // value so the next read falls through to it.
                self.cache.lock().unwrap().remove(node_id);
                Ok(false)
            }
            Err(err) => {
                self.cache.lock().unwrap().remove(node_id);
                Err(err)
            }
        }
    }

    /// Revocation: removes both layers and evicts any live session.
    pub async fn delete(&self, node_id: &NodeId, reason: &str) -> Result<u64, RepoError> {
        self.cache.lock().unwrap().remove(node_id);
        let rows = self.repo.delete(&node_id.0).await?;
        info!(%node_id, "Worker credential revoked");
        self.disconnect
            .disconnect(
                node_id,
                SessionError::PermissionDenied(format!("Credential revoked: {reason}")),
            )
            .await;
        Ok(rows)
    }
}
