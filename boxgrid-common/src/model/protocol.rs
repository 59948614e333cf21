//! The worker-facing frame protocol: one sum type per direction, carried
//! as JSON text messages over the worker's bidirectional stream.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Worker -> console frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectRequest {
    Hello(ConnectHello),
    Heartbeat(HeartbeatFrame),
    CommandResult(CommandResultFrame),
}

/// Must be the first frame on a fresh stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectHello {
    pub node_id: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub executor_kind: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub version: String,
    pub worker_secret: String,
    #[serde(default)]
    pub capabilities: Vec<CapabilityDeclaration>,
    #[serde(default)]
    pub timestamp_unix_ms: i64,
    // Legacy fields, carried but not validated when the node credential matches.
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub signature: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDeclaration {
    pub name: String,
    #[serde(default)]
    pub max_inflight: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatFrame {
    pub node_id: String,
    pub session_id: String,
    #[serde(default)]
    pub sent_at_unix_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandResultFrame {
    pub command_id: String,
    #[serde(default)]
    pub payload_json: String,
    #[serde(default)]
    pub error: Option<CommandErrorBody>,
    #[serde(default)]
    pub completed_unix_ms: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandErrorBody {
    pub code: String,
    pub message: String,
}

/// Console -> worker frames.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectResponse {
    ConnectAck(ConnectAck),
    HeartbeatAck(HeartbeatAck),
    CommandDispatch(CommandDispatch),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectAck {
    pub session_id: String,
    pub heartbeat_interval_sec: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub heartbeat_interval_sec: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandDispatch {
    pub command_id: String,
    pub capability: String,
    pub payload_json: String,
    #[serde(default)]
    pub deadline_unix_ms: Option<i64>,
}
