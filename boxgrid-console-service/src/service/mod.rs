use std::sync::Arc;

use crate::config::ConsoleServiceConfig;
use crate::db;
use crate::repo::task::{DbTaskRepo, TaskRepo};
use crate::repo::worker_credential::{DbWorkerCredentialRepo, WorkerCredentialRepo};
use crate::repo::worker_node::{DbWorkerNodeRepo, WorkerNodeRepo};
use crate::service::credential::{SecretHasher, WorkerCredentialService};
use crate::service::dispatch::CommandDispatchService;
use crate::service::provisioning::WorkerProvisioningService;
use crate::service::routing::TerminalRouteTable;
use crate::service::session::{LazySessionDisconnect, SessionService};
use crate::service::task::TaskService;
use boxgrid_common::config::DbConfig;

pub mod credential;
pub mod dispatch;
pub mod provisioning;
pub mod routing;
pub mod scope;
pub mod session;
pub mod task;

#[derive(Clone)]
pub struct Services {
    pub session_service: Arc<SessionService>,
    pub dispatch_service: Arc<CommandDispatchService>,
    pub task_service: Arc<TaskService>,
    pub credential_service: Arc<WorkerCredentialService>,
    pub provisioning_service: Arc<WorkerProvisioningService>,
}

impl Services {
    pub async fn new(config: &ConsoleServiceConfig) -> Result<Services, String> {
        match config.db.clone() {
            DbConfig::Postgres(db_config) => {
                let db_pool = Arc::new(
                    db::create_postgres_pool(&db_config)
                        .await
                        .map_err(|e| e.to_string())?,
                );
                let node_repo: Arc<dyn WorkerNodeRepo> =
                    Arc::new(DbWorkerNodeRepo::new(db_pool.clone()));
                let credential_repo: Arc<dyn WorkerCredentialRepo> =
                    Arc::new(DbWorkerCredentialRepo::new(db_pool.clone()));
                let task_repo: Arc<dyn TaskRepo> = Arc::new(DbTaskRepo::new(db_pool.clone()));
                Ok(Self::build(config, node_repo, credential_repo, task_repo))
            }
            DbConfig::Sqlite(db_config) => {
                let db_pool = Arc::new(
                    db::create_sqlite_pool(&db_config)
                        .await
                        .map_err(|e| e.to_string())?,
                );
                let node_repo: Arc<dyn WorkerNodeRepo> =
                    Arc::new(DbWorkerNodeRepo::new(db_pool.clone()));
                let credential_repo: Arc<dyn WorkerCredentialRepo> =
                    Arc::new(DbWorkerCredentialRepo::new(db_pool.clone()));
                let task_repo: Arc<dyn TaskRepo> = Arc::new(DbTaskRepo::new(db_pool.clone()));
                Ok(Self::build(config, node_repo, credential_repo, task_repo))
            }
        }
    }

    /// Wires the service graph over the given repos. Public so tests can
    /// inject in-memory Sqlite pools.
    pub fn build(
        config: &ConsoleServiceConfig,
        node_repo: Arc<dyn WorkerNodeRepo>,
        credential_repo: Arc<dyn WorkerCredentialRepo>,
        task_repo: Arc<dyn TaskRepo>,
    ) -> Services {
        let routes = Arc::new(TerminalRouteTable::new(
            config.routing.ttl,
            config.routing.prune_interval,
        ));
        let disconnect = LazySessionDisconnect::default();
        let hasher = config
            .credentials
            .hmac_key
            .as_ref()
            .map(|key| SecretHasher::new(key.as_bytes().to_vec()));
        let credential_service = Arc::new(WorkerCredentialService::new(
            credential_repo,
            hasher,
            disconnect.clone(),
        ));
        let session_service = Arc::new(SessionService::new(
            node_repo.clone(),
            credential_service.clone(),
            routes.clone(),
            config.sessions.clone(),
        ));
        disconnect.set(session_service.clone());
        let dispatch_service = Arc::new(CommandDispatchService::new(
            session_service.clone(),
            routes,
        ));
        let task_service = Arc::new(TaskService::new(
            task_repo,
            dispatch_service.clone(),
            session_service.clone(),
            config.tasks.clone(),
        ));
        let provisioning_service = Arc::new(WorkerProvisioningService::new(
            node_repo,
            credential_service.clone(),
        ));

        Services {
            session_service,
            dispatch_service,
            task_service,
            credential_service,
            provisioning_service,
        }
    }
}
