use crate::service::session::SessionService;
use crate::service::Services;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;

pub mod connect;
pub mod healthcheck;

#[derive(Clone)]
pub struct ApiState {
    pub sessions: Arc<SessionService>,
}

pub fn make_router(services: &Services) -> Router {
    Router::new()
        .route("/v1/workers/connect", get(connect::handle_ws))
        .route("/healthz", get(healthcheck::healthz))
        .with_state(ApiState {
            sessions: services.session_service.clone(),
        })
}
