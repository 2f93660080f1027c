use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::services::project::DiscardReason;
use crate::utils::ApiErrorResponse;

/// Rejection of a store request before the event is queued.
#[derive(Debug, thiserror::Error)]
pub enum BadStoreRequest {
    /// The project id in the request path is malformed.
    #[error("invalid project id in request path")]
    BadProject,
    /// Authentication is missing or could not be parsed.
    #[error("missing or malformed authentication information")]
    BadAuth,
    /// The client speaks a protocol version newer than this relay supports.
    #[error("unsupported protocol version ({0})")]
    UnsupportedProtocolVersion(u16),
    /// The public key in the authentication is not a valid project key.
    #[error("malformed public key in authentication")]
    BadPublicKey,
    /// The request body is empty.
    #[error("empty request body")]
    EmptyBody,
    /// The JSON payload could not be parsed.
    #[error("invalid JSON payload")]
    InvalidJson(#[source] serde_json::Error),
    /// The event was rejected against the project configuration.
    #[error("event rejected ({})", .0.name())]
    EventRejected(DiscardReason),
    /// An internal service is not available to take the event.
    #[error("service unavailable")]
    ScheduleFailed,
}

impl BadStoreRequest {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadProject
            | Self::UnsupportedProtocolVersion(_)
            | Self::BadPublicKey
            | Self::EmptyBody
            | Self::InvalidJson(_) => StatusCode::BAD_REQUEST,
            Self::BadAuth => StatusCode::UNAUTHORIZED,
            Self::EventRejected(_) => StatusCode::FORBIDDEN,
            Self::ScheduleFailed => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for BadStoreRequest {
    fn into_response(self) -> Response {
        let body = Json(ApiErrorResponse::from_error(&self));
        (self.status(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(BadStoreRequest::BadAuth.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            BadStoreRequest::EventRejected(DiscardReason::DisabledKey).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            BadStoreRequest::ScheduleFailed.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
