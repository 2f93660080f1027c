use std::net::{IpAddr, SocketAddr};

use axum::extract::connect_info::ConnectInfo;
use axum::extract::{FromRequestParts, Path};
use axum::http::request::Parts;
use axum::RequestPartsExt;
use relay_common::auth::{Auth, MAX_PROTOCOL_VERSION};
use relay_common::{ProjectId, ProjectKey};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::endpoints::common::BadStoreRequest;
use crate::service::ServiceState;

/// Request information relevant for all store-like endpoints.
///
/// Carries the parsed client authentication as well as the project, origin and remote address
/// of the request. The meta data travels with the event until it is delivered upstream.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RequestMeta {
    auth: Auth,
    public_key: ProjectKey,
    project_id: ProjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    remote_addr: Option<IpAddr>,
}

impl RequestMeta {
    /// Returns the parsed client authentication.
    pub fn auth(&self) -> &Auth {
        &self.auth
    }

    /// Returns the project key the client authenticated with.
    pub fn public_key(&self) -> ProjectKey {
        self.public_key
    }

    /// Returns the project id from the request path.
    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }

    /// Returns the request origin, if submitted by the client.
    pub fn origin(&self) -> Option<&Url> {
        self.origin.as_ref()
    }

    /// Returns the client's remote address.
    pub fn remote_addr(&self) -> Option<IpAddr> {
        self.remote_addr
    }

    /// Renders the `X-Sentry-Auth` header value used when forwarding the event.
    pub fn auth_header(&self) -> String {
        self.auth.to_string()
    }

    #[cfg(test)]
    pub fn for_test(project_id: ProjectId, public_key: ProjectKey) -> Self {
        Self {
            auth: format!("Sentry sentry_version=7, sentry_key={public_key}")
                .parse()
                .unwrap(),
            public_key,
            project_id,
            origin: None,
            remote_addr: None,
        }
    }
}

/// Parses authentication from the `X-Sentry-Auth` header, falling back to the query string.
fn auth_from_parts(parts: &Parts) -> Result<Auth, BadStoreRequest> {
    if let Some(header) = parts.headers.get("x-sentry-auth") {
        let header = header.to_str().map_err(|_| BadStoreRequest::BadAuth)?;
        return header.parse().map_err(|_| BadStoreRequest::BadAuth);
    }

    let query = parts.uri.query().unwrap_or("");
    Auth::from_querystring(query).map_err(|_| BadStoreRequest::BadAuth)
}

fn origin_from_parts(parts: &Parts) -> Option<Url> {
    let origin = parts
        .headers
        .get("origin")
        .or_else(|| parts.headers.get("referer"))?;

    origin.to_str().ok()?.parse().ok()
}

impl FromRequestParts<ServiceState> for RequestMeta {
    type Rejection = BadStoreRequest;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &ServiceState,
    ) -> Result<Self, Self::Rejection> {
        let Path(project_id) = parts
            .extract::<Path<ProjectId>>()
            .await
            .map_err(|_| BadStoreRequest::BadProject)?;

        let auth = auth_from_parts(parts)?;
        if auth.version() > MAX_PROTOCOL_VERSION {
            return Err(BadStoreRequest::UnsupportedProtocolVersion(auth.version()));
        }

        let public_key = auth
            .public_key()
            .parse()
            .map_err(|_| BadStoreRequest::BadPublicKey)?;

        let remote_addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        Ok(RequestMeta {
            auth,
            public_key,
            project_id,
            origin: origin_from_parts(parts),
            remote_addr,
        })
    }
}
