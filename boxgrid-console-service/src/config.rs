use boxgrid_common::config::{ConfigLoader, DbConfig};
use boxgrid_common::model::WorkerType;
use boxgrid_common::tracing::TracingConfig;
use boxgrid_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsoleServiceConfig {
    pub tracing: TracingConfig,
    pub environment: String,
    pub workspace: String,
    pub http_port: u16,
    pub db: DbConfig,
    pub sessions: SessionConfig,
    pub routing: TerminalRouteConfig,
    pub tasks: TaskConfig,
    pub credentials: CredentialConfig,
    pub bootstrap_workers: HashMap<String, BootstrapWorkerConfig>,
}

impl Default for ConsoleServiceConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("console-service"),
            environment: "dev".to_string(),
            workspace: "release".to_string(),
            http_port: 8080,
            db: DbConfig::default(),
            sessions: SessionConfig::default(),
            routing: TerminalRouteConfig::default(),
            tasks: TaskConfig::default(),
            credentials: CredentialConfig::default(),
            bootstrap_workers: HashMap::new(),
        }
    }
}

impl SafeDisplay for ConsoleServiceConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "environment: {}", self.environment);
        let _ = writeln!(&mut result, "workspace: {}", self.workspace);
        let _ = writeln!(&mut result, "HTTP port: {}", self.http_port);
        let _ = writeln!(&mut result, "DB:");
        let _ = writeln!(&mut result, "{}", self.db.to_safe_string_indented());
        let _ = writeln!(&mut result, "sessions:");
        let _ = writeln!(&mut result, "{}", self.sessions.to_safe_string_indented());
        let _ = writeln!(&mut result, "routing:");
        let _ = writeln!(&mut result, "{}", self.routing.to_safe_string_indented());
        let _ = writeln!(&mut result, "tasks:");
        let _ = writeln!(&mut result, "{}", self.tasks.to_safe_string_indented());
        let _ = writeln!(&mut result, "credentials:");
        let _ = writeln!(&mut result, "{}", self.credentials.to_safe_string_indented());
        let _ = writeln!(
            &mut result,
            "bootstrap workers: {}",
            self.bootstrap_workers
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        );
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub offline_ttl: Duration,
    pub control_outbound_buffer: usize,
    pub command_outbound_buffer: usize,
    #[serde(with = "humantime_serde")]
    pub heartbeat_ack_enqueue_timeout: Duration,
    pub max_node_id_length: usize,
    pub default_capability_max_inflight: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            offline_ttl: Duration::from_secs(60),
            control_outbound_buffer: 32,
            command_outbound_buffer: 128,
            heartbeat_ack_enqueue_timeout: Duration::from_millis(500),
            max_node_id_length: 128,
            default_capability_max_inflight: 4,
        }
    }
}

impl SafeDisplay for SessionConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "heartbeat interval: {:?}", self.heartbeat_interval);
        let _ = writeln!(&mut result, "offline TTL: {:?}", self.offline_ttl);
        let _ = writeln!(
            &mut result,
            "outbound buffers: control {}, command {}",
            self.control_outbound_buffer, self.command_outbound_buffer
        );
        let _ = writeln!(
            &mut result,
            "heartbeat ack enqueue timeout: {:?}",
            self.heartbeat_ack_enqueue_timeout
        );
        let _ = writeln!(&mut result, "max node id length: {}", self.max_node_id_length);
        let _ = writeln!(
            &mut result,
            "default capability max inflight: {}",
            self.default_capability_max_inflight
        );
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TerminalRouteConfig {
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub prune_interval: Duration,
}

impl Default for TerminalRouteConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
            prune_interval: Duration::from_secs(60),
        }
    }
}

impl SafeDisplay for TerminalRouteConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "TTL: {:?}", self.ttl);
        let _ = writeln!(&mut result, "prune interval: {:?}", self.prune_interval);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(with = "humantime_serde")]
    pub default_wait: Duration,
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub max_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    #[serde(with = "humantime_serde")]
    pub prune_interval: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            default_wait: Duration::from_millis(1500),
            max_wait: Duration::from_secs(60),
            default_timeout: Duration::from_secs(60),
            max_timeout: Duration::from_secs(10 * 60),
            retention: Duration::from_secs(24 * 60 * 60),
            prune_interval: Duration::from_secs(15),
        }
    }
}

impl SafeDisplay for TaskConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "default wait: {:?}", self.default_wait);
        let _ = writeln!(&mut result, "max wait: {:?}", self.max_wait);
        let _ = writeln!(&mut result, "default timeout: {:?}", self.default_timeout);
        let _ = writeln!(&mut result, "max timeout: {:?}", self.max_timeout);
        let _ = writeln!(&mut result, "retention: {:?}", self.retention);
        let _ = writeln!(&mut result, "prune interval: {:?}", self.prune_interval);
        result
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CredentialConfig {
    /// When set, provisioned worker secrets are stored as HMAC-SHA256
    /// hashes under this key instead of plaintext.
    pub hmac_key: Option<String>,
}

impl SafeDisplay for CredentialConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(
            &mut result,
            "hmac key: {}",
            if self.hmac_key.is_some() { "****" } else { "<unset>" }
        );
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootstrapWorkerConfig {
    pub secret: String,
    #[serde(default)]
    pub owner_id: String,
    #[serde(default)]
    pub worker_type: WorkerType,
}

impl SafeDisplay for BootstrapWorkerConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "secret: ****");
        let _ = writeln!(&mut result, "owner id: {}", self.owner_id);
        let _ = writeln!(&mut result, "worker type: {}", self.worker_type);
        result
    }
}

pub fn make_config_loader() -> ConfigLoader<ConsoleServiceConfig> {
    ConfigLoader::new(&PathBuf::from("config/console-service.toml"))
}
