pub mod api;
pub mod config;
pub mod db;
pub mod model;
pub mod repo;
pub mod service;

use crate::config::ConsoleServiceConfig;
use crate::service::Services;
use anyhow::{anyhow, Context};
use boxgrid_common::config::DbConfig;
use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{debug, info};

#[cfg(test)]
test_r::enable!();

pub struct RunDetails {
    pub http_port: u16,
}

#[derive(Clone)]
pub struct ConsoleService {
    config: ConsoleServiceConfig,
    services: Services,
}

impl ConsoleService {
    pub async fn new(config: ConsoleServiceConfig) -> Result<Self, anyhow::Error> {
        debug!("Initializing console service");

        match &config.db {
            DbConfig::Postgres(db_config) => {
                db::postgres_migrate(db_config)
                    .await
                    .context("Postgres DB migration")?;
            }
            DbConfig::Sqlite(db_config) => {
                db::sqlite_migrate(db_config)
                    .await
                    .context("SQLite DB migration")?;
            }
        };

        let services = Services::new(&config)
            .await
            .map_err(|err| anyhow!(err).context("Service initialization"))?;

        install_bootstrap_workers(&config, &services).await?;

        Ok(Self { config, services })
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub async fn run(
        &self,
        join_set: &mut JoinSet<Result<(), anyhow::Error>>,
    ) -> Result<RunDetails, anyhow::Error> {
        let app = api::make_router(&self.services);
        let listener =
            tokio::net::TcpListener::bind(("0.0.0.0", self.config.http_port)).await?;
        let http_port = listener.local_addr()?.port();

        join_set.spawn(async move {
            axum::serve(listener, app)
                .await
                .map_err(|err| anyhow!(err).context("HTTP server failed"))
        });

        let session_service = self.services.session_service.clone();
        let sweep_interval = self.config.sessions.heartbeat_interval;
        join_set.spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                session_service.sweep_stale_sessions(Utc::now()).await;
            }
        });

        info!("Started console service on http port {http_port}");
        Ok(RunDetails { http_port })
    }
}

async fn install_bootstrap_workers(
    config: &ConsoleServiceConfig,
    services: &Services,
) -> Result<(), anyhow::Error> {
    for (node_id, worker) in &config.bootstrap_workers {
        info!("Installing bootstrap worker {node_id}");
        services
            .provisioning_service
            .install_bootstrap_worker(
                node_id,
                &worker.secret,
                &worker.owner_id,
                worker.worker_type,
                Utc::now(),
            )
            .await
            .with_context(|| format!("Bootstrap worker {node_id}"))?;
    }
    Ok(())
}
