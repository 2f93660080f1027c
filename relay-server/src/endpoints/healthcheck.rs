//! Health check endpoint, `GET /api/relay/healthcheck/`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::service::ServiceState;
use crate::services::health_check::IsHealthy;

#[derive(Debug, Serialize)]
struct HealthcheckResponse {
    is_healthy: bool,
}

pub async fn handle(State(state): State<ServiceState>) -> impl IntoResponse {
    let is_healthy = state
        .health_check()
        .send(IsHealthy)
        .await
        .unwrap_or(false);

    let status = if is_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(HealthcheckResponse { is_healthy }))
}
