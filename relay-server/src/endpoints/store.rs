//! Handles event store requests.

use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::Json;
use bytes::Bytes;
use relay_config::RelayMode;
use relay_statsd::metric;
use serde::Serialize;

use crate::endpoints::common::BadStoreRequest;
use crate::envelope::{Envelope, EventId};
use crate::extractors::RequestMeta;
use crate::service::ServiceState;
use crate::services::forwarder::EnqueueEvent;
use crate::services::project_cache::GetProjectState;
use crate::statsd::RelayCounters;

#[derive(Debug, Serialize)]
pub(crate) struct StoreResponse {
    id: EventId,
}

/// The store endpoint, `POST /api/{project_id}/store/`.
///
/// Validates the request against the cached project configuration and hands the event to the
/// forwarder. The response only confirms acceptance into the queue, not upstream delivery. In
/// proxy mode, events are accepted without consulting project states.
pub async fn handle(
    State(state): State<ServiceState>,
    meta: RequestMeta,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<StoreResponse>, BadStoreRequest> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/json")
        .to_owned();

    let envelope = Envelope::from_request(meta, content_type, body)?;

    if state.config().relay_mode() == RelayMode::Managed {
        let project_state = state
            .project_cache()
            .send(GetProjectState {
                project_key: envelope.meta().public_key(),
            })
            .await
            .map_err(|_| BadStoreRequest::ScheduleFailed)?;

        if let Err(reason) = project_state.check_request(envelope.meta()) {
            metric!(counter(RelayCounters::EventRejected) += 1, reason = reason.name());
            return Err(BadStoreRequest::EventRejected(reason));
        }
    }

    let id = envelope.event_id();
    state.forwarder().send(EnqueueEvent(envelope));

    metric!(
        counter(RelayCounters::EventAccepted) += 1,
        mode = match state.config().relay_mode() {
            RelayMode::Managed => "managed",
            RelayMode::Proxy => "proxy",
        }
    );

    Ok(Json(StoreResponse { id }))
}
