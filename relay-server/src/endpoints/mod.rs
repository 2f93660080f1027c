//! Web server endpoints.

pub mod common;

mod healthcheck;
mod store;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use relay_config::Config;

use crate::service::ServiceState;

/// Builds the router for all supported endpoints.
pub fn routes(config: &Config) -> Router<ServiceState> {
    Router::new()
        .route("/api/relay/healthcheck/", get(healthcheck::handle))
        .route("/api/{project_id}/store/", post(store::handle))
        .layer(DefaultBodyLimit::max(config.max_event_size()))
}
