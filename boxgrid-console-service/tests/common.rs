use std::sync::Arc;
use std::time::Duration;

use boxgrid_common::model::protocol::{
    CapabilityDeclaration, CommandDispatch, CommandResultFrame, ConnectHello, ConnectRequest,
    ConnectResponse,
};
use boxgrid_common::model::{TaskId, TaskStatus, WorkerType};
use boxgrid_console_service::config::ConsoleServiceConfig;
use boxgrid_console_service::model::Task;
use boxgrid_console_service::repo::task::DbTaskRepo;
use boxgrid_console_service::repo::worker_credential::DbWorkerCredentialRepo;
use boxgrid_console_service::repo::worker_node::{DbWorkerNodeRepo, WorkerNodeRepo};
use boxgrid_console_service::service::session::{ActiveSession, OpenSession, SessionService};
use boxgrid_console_service::service::Services;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::mpsc;

pub struct TestEnv {
    pub services: Services,
    pub node_repo: Arc<dyn WorkerNodeRepo>,
}

pub async fn test_env() -> TestEnv {
    test_env_with_config(ConsoleServiceConfig::default()).await
}

pub async fn test_env_with_config(config: ConsoleServiceConfig) -> TestEnv {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to open in-memory sqlite");
    sqlx::migrate!("./db/migration/sqlite")
        .run(&pool)
        .await
        .expect("Failed to run migrations");
    let pool = Arc::new(pool);

    let node_repo: Arc<dyn WorkerNodeRepo> = Arc::new(DbWorkerNodeRepo::new(pool.clone()));
    let services = Services::build(
        &config,
        node_repo.clone(),
        Arc::new(DbWorkerCredentialRepo::new(pool.clone())),
        Arc::new(DbTaskRepo::new(pool)),
    );
    TestEnv {
        services,
        node_repo,
    }
}

pub async fn install_worker(env: &TestEnv, node_id: &str, secret: &str) {
    env.services
        .provisioning_service
        .install_bootstrap_worker(node_id, secret, "", WorkerType::Normal, Utc::now())
        .await
        .expect("Failed to install worker");
}

pub fn hello(node_id: &str, secret: &str, capabilities: &[(&str, u32)]) -> ConnectHello {
    ConnectHello {
        node_id: node_id.to_string(),
        node_name: node_id.to_string(),
        executor_kind: "test".to_string(),
        labels: Default::default(),
        version: "0.0.0-test".to_string(),
        worker_secret: secret.to_string(),
        capabilities: capabilities
            .iter()
            .map(|(name, max_inflight)| CapabilityDeclaration {
                name: name.to_string(),
                max_inflight: *max_inflight,
            })
            .collect(),
        timestamp_unix_ms: Utc::now().timestamp_millis(),
        nonce: String::new(),
        signature: String::new(),
    }
}

pub async fn connect(
    env: &TestEnv,
    node_id: &str,
    secret: &str,
    capabilities: &[(&str, u32)],
) -> OpenSession {
    env.services
        .session_service
        .open_session(hello(node_id, secret, capabilities))
        .await
        .expect("Failed to open session")
}

pub type Responder = Box<dyn Fn(&CommandDispatch) -> Option<CommandResultFrame> + Send + Sync>;

/// Echoes the dispatched payload back as the result.
pub fn echo_responder() -> Responder {
    Box::new(|dispatch| {
        Some(CommandResultFrame {
            command_id: dispatch.command_id.clone(),
            payload_json: dispatch.payload_json.clone(),
            error: None,
            completed_unix_ms: Some(Utc::now().timestamp_millis()),
        })
    })
}

/// Swallows every dispatch without ever resulting it.
pub fn silent_responder() -> Responder {
    Box::new(|_| None)
}

pub struct WorkerHandle {
    pub session: Arc<ActiveSession>,
    pub dispatches: mpsc::UnboundedReceiver<CommandDispatch>,
}

impl WorkerHandle {
    pub fn drain_dispatches(&mut self) -> Vec<CommandDispatch> {
        let mut dispatches = Vec::new();
        while let Ok(dispatch) = self.dispatches.try_recv() {
            dispatches.push(dispatch);
        }
        dispatches
    }
}

/// Drives the session's writer like a real worker process would: records
/// every command dispatch and answers it through the responder.
pub fn spawn_worker(
    sessions: Arc<SessionService>,
    open: OpenSession,
    responder: Responder,
) -> WorkerHandle {
    let session = open.session;
    let mut writer = open.writer;
    let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
    let worker_session = session.clone();
    tokio::spawn(async move {
        while let Some(frame) = writer.next().await {
            if let ConnectResponse::CommandDispatch(dispatch) = frame {
                let _ = dispatch_tx.send(dispatch.clone());
                if let Some(result) = responder(&dispatch) {
                    let _ = sessions
                        .handle_frame(&worker_session, ConnectRequest::CommandResult(result))
                        .await;
                }
            }
        }
    });
    WorkerHandle {
        session,
        dispatches: dispatch_rx,
    }
}

/// Polls the owner-scoped snapshot until the task reaches a terminal
/// state.
pub async fn wait_until_terminal(env: &TestEnv, owner_id: &str, task_id: &TaskId) -> Task {
    for _ in 0..200 {
        let task = env
            .services
            .task_service
            .get_task(owner_id, task_id)
            .await
            .expect("Failed to load task");
        if task.status.is_terminal() {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Task {task_id} did not reach a terminal state in time");
}

pub fn assert_status(task: &Task, status: TaskStatus) {
    assert_eq!(
        task.status, status,
        "unexpected status for task {} (error: {:?} / {:?})",
        task.task_id, task.error_code, task.error_message
    );
}
