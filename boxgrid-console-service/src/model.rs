use boxgrid_common::model::{CommandId, NodeId, SessionId, TaskId, TaskMode, TaskStatus, WorkerType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Owner-scoped, durable record of one submitted command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub owner_id: String,
    pub request_id: Option<String>,
    pub command_id: Option<CommandId>,
    pub capability: String,
    pub status: TaskStatus,
    pub input_json: String,
    pub result_json: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deadline_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default)]
pub struct SubmitTaskRequest {
    pub owner_id: String,
    pub capability: String,
    pub input_json: Option<String>,
    pub mode: TaskMode,
    pub wait: Option<Duration>,
    pub timeout: Option<Duration>,
    pub request_id: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SubmittedTask {
    pub task: Task,
    /// True when the snapshot is already terminal.
    pub completed: bool,
}

/// Stored form of a worker credential. The plaintext secret is only ever
/// returned once, from provisioning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoredCredential {
    Plain { secret: String },
    Hashed { hash: String, algo: String },
}

pub const CREDENTIAL_ALGO_PLAIN: &str = "plain";
pub const CREDENTIAL_ALGO_HMAC_SHA256: &str = "hmac-sha256";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedWorker {
    pub worker_id: NodeId,
    pub worker_secret: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerNode {
    pub node_id: NodeId,
    pub session_id: Option<SessionId>,
    pub name: String,
    pub executor_kind: String,
    pub labels: HashMap<String, String>,
    pub owner_id: String,
    pub worker_type: WorkerType,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapabilityInflight {
    pub capability: String,
    pub inflight: u32,
    pub max_inflight: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeInflightStats {
    pub node_id: NodeId,
    pub session_id: SessionId,
    pub capabilities: Vec<CapabilityInflight>,
}
