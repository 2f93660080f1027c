//! Client for the upstream ingestion service.
//!
//! The upstream service owns the HTTP connection pool and is the only place in the server that
//! performs outbound I/O. Queries are JSON messages signed with the relay credentials, requests
//! are raw forwards that consume their own result. Connection failures flip a network outage
//! flag which is probed in the background and feeds the health check.

use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::future::BoxFuture;
use relay_common::RetryBackoff;
use relay_config::Config;
use relay_log::LogError;
use relay_statsd::metric;
use relay_system::{AsyncResponse, FromMessage, Interface, NoResponse, Sender, Service};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::statsd::{RelayCounters, RelayGauges, RelayTimers};
use crate::utils::ApiErrorResponse;

/// Rejection or failure of an upstream request.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamRequestError {
    /// The relay has no credentials to sign queries with.
    #[error("relay has no credentials configured")]
    NoCredentials,
    /// The request could not be sent or the response not received.
    #[error("could not send request to upstream")]
    SendFailed(#[source] reqwest::Error),
    /// The upstream responded with a non-success status code.
    #[error("upstream request returned error {0}")]
    ResponseError(StatusCode, #[source] ApiErrorResponse),
    /// The request payload could not be serialized.
    #[error("could not serialize upstream request payload")]
    SerializeFailed(#[source] serde_json::Error),
    /// The response body could not be parsed.
    #[error("could not parse upstream response")]
    InvalidJson(#[source] serde_json::Error),
    /// The upstream service stopped before responding.
    #[error("upstream service stopped")]
    ChannelClosed,
}

impl UpstreamRequestError {
    /// Returns `true` if the error indicates a network downtime.
    ///
    /// Network errors are transient and retried, and they flip the outage flag.
    pub fn is_network_error(&self) -> bool {
        match self {
            Self::SendFailed(error) => {
                error.is_timeout() || error.is_connect() || error.is_request()
            }
            Self::ResponseError(code, _) => matches!(code.as_u16(), 502 | 503 | 504),
            _ => false,
        }
    }

    /// Returns `true` if the upstream rejected the payload permanently.
    ///
    /// Permanent rejections must not be retried.
    pub fn is_permanent_rejection(&self) -> bool {
        match self {
            Self::ResponseError(code, _) => code.is_client_error(),
            _ => false,
        }
    }
}

/// A JSON query to the upstream, signed with the relay credentials.
pub trait UpstreamQuery: Serialize + Send + Sync + 'static {
    /// The response type the upstream returns for this query.
    type Response: DeserializeOwned + Send + 'static;

    /// The HTTP method of the query.
    fn method(&self) -> Method {
        Method::POST
    }

    /// The path relative to the upstream root.
    fn path(&self) -> Cow<'static, str>;
}

/// Sends a signed query to the upstream and resolves with the parsed response.
#[derive(Debug)]
pub struct SendQuery<T: UpstreamQuery>(pub T);

/// A raw request to the upstream that consumes its own result.
///
/// Unlike [`UpstreamQuery`], requests are not signed and not retried. The forwarder uses this to
/// deliver event payloads with the client's original authentication.
pub trait UpstreamRequest: Send + 'static {
    /// The HTTP method of the request.
    fn method(&self) -> Method {
        Method::POST
    }

    /// The path relative to the upstream root.
    fn path(&self) -> Cow<'_, str>;

    /// Adds headers and the body onto the prepared request builder.
    fn build(&mut self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder;

    /// Consumes the result of the request.
    fn respond(
        self: Box<Self>,
        result: Result<reqwest::Response, UpstreamRequestError>,
    ) -> BoxFuture<'static, ()>;
}

/// Fire-and-forget message to issue an [`UpstreamRequest`].
#[derive(Debug)]
pub struct SendRequest<T: UpstreamRequest>(pub T);

/// Returns whether the upstream is currently in a network outage.
#[derive(Debug)]
pub struct IsNetworkOutage;

/// The raw response body of a query, before JSON parsing.
pub type QueryResult = Result<Bytes, UpstreamRequestError>;

/// Type-erased [`UpstreamQuery`] with its response channel attached.
pub trait AnyQuery: Send + Sync {
    /// The HTTP method of the query.
    fn method(&self) -> Method;
    /// The path relative to the upstream root.
    fn path(&self) -> Cow<'static, str>;
    /// Serializes the query body to JSON.
    fn serialize_body(&self) -> Result<Vec<u8>, serde_json::Error>;
    /// Parses the raw result and resolves the waiting request.
    fn respond(self: Box<Self>, result: QueryResult);
}

struct QueryRequest<T: UpstreamQuery> {
    query: T,
    sender: Sender<Result<T::Response, UpstreamRequestError>>,
}

impl<T: UpstreamQuery> AnyQuery for QueryRequest<T> {
    fn method(&self) -> Method {
        self.query.method()
    }

    fn path(&self) -> Cow<'static, str> {
        self.query.path()
    }

    fn serialize_body(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.query)
    }

    fn respond(self: Box<Self>, result: QueryResult) {
        let result = result.and_then(|body| {
            serde_json::from_slice(&body).map_err(UpstreamRequestError::InvalidJson)
        });

        self.sender.send(result);
    }
}

/// Service interface of the upstream client.
pub enum UpstreamRelay {
    /// A signed JSON query, see [`SendQuery`].
    Query(Box<dyn AnyQuery>),
    /// A raw forwarded request, see [`SendRequest`].
    Request(Box<dyn UpstreamRequest>),
    /// Reads the current outage flag, see [`IsNetworkOutage`].
    IsNetworkOutage(Sender<bool>),
}

impl std::fmt::Debug for UpstreamRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Query(_) => f.pad("Query"),
            Self::Request(_) => f.pad("Request"),
            Self::IsNetworkOutage(_) => f.pad("IsNetworkOutage"),
        }
    }
}

impl Interface for UpstreamRelay {}

impl<T: UpstreamQuery> FromMessage<SendQuery<T>> for UpstreamRelay {
    type Response = AsyncResponse<Result<T::Response, UpstreamRequestError>>;

    fn from_message(
        message: SendQuery<T>,
        sender: Sender<Result<T::Response, UpstreamRequestError>>,
    ) -> Self {
        Self::Query(Box::new(QueryRequest {
            query: message.0,
            sender,
        }))
    }
}

impl<T: UpstreamRequest> FromMessage<SendRequest<T>> for UpstreamRelay {
    type Response = NoResponse;

    fn from_message(message: SendRequest<T>, _: ()) -> Self {
        Self::Request(Box::new(message.0))
    }
}

impl FromMessage<IsNetworkOutage> for UpstreamRelay {
    type Response = AsyncResponse<bool>;

    fn from_message(_: IsNetworkOutage, sender: Sender<bool>) -> Self {
        Self::IsNetworkOutage(sender)
    }
}

struct SharedClient {
    config: Arc<Config>,
    reqwest: reqwest::Client,
    outage: AtomicBool,
}

impl SharedClient {
    fn new(config: Arc<Config>) -> Self {
        let reqwest = reqwest::Client::builder()
            .connect_timeout(config.http_connection_timeout())
            .timeout(config.http_timeout())
            .build()
            .unwrap();

        Self {
            config,
            reqwest,
            outage: AtomicBool::new(false),
        }
    }

    /// Sends a prepared request and converts non-success responses into errors.
    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, UpstreamRequestError> {
        let start = Instant::now();
        let result = builder.send().await;

        metric!(
            timer(RelayTimers::UpstreamRequestDuration) = start.elapsed(),
            result = if result.is_ok() { "ok" } else { "error" }
        );

        let response = result.map_err(UpstreamRequestError::SendFailed)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let api_response = response
            .json::<ApiErrorResponse>()
            .await
            .unwrap_or_default();

        Err(UpstreamRequestError::ResponseError(status, api_response))
    }

    /// Flags a network outage and starts the recovery probe.
    fn notify_network_error(self: &Arc<Self>) {
        metric!(counter(RelayCounters::UpstreamNetworkError) += 1);

        if self.outage.swap(true, Ordering::SeqCst) {
            return;
        }

        relay_log::warn!(
            "network outage, scheduling checks to the upstream {}",
            self.config.upstream_descriptor()
        );
        metric!(gauge(RelayGauges::NetworkOutage) = 1);

        let client = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(client.config.http_outage_grace_period()).await;

            let mut backoff = RetryBackoff::new(client.config.http_max_retry_interval());
            loop {
                tokio::time::sleep(backoff.next_backoff()).await;

                let url = client.config.upstream_descriptor().get_url("/api/0/relays/live/");
                match client.send(client.reqwest.get(url)).await {
                    Ok(_) => break,
                    Err(error) => {
                        relay_log::debug!("upstream is still down: {}", LogError(&error));
                    }
                }
            }

            relay_log::info!("recovering from network outage");
            metric!(gauge(RelayGauges::NetworkOutage) = 0);
            client.outage.store(false, Ordering::SeqCst);
        });
    }

    /// Executes a query with signing and bounded retries on network errors.
    async fn execute_query(self: &Arc<Self>, query: &dyn AnyQuery) -> QueryResult {
        let credentials = self
            .config
            .credentials()
            .ok_or(UpstreamRequestError::NoCredentials)?;

        let body = query
            .serialize_body()
            .map_err(UpstreamRequestError::SerializeFailed)?;
        let signature = credentials.secret_key.sign(&body);

        let deadline = Instant::now() + self.config.query_timeout();
        let mut backoff = RetryBackoff::new(self.config.http_max_retry_interval());

        loop {
            let url = self.config.upstream_descriptor().get_url(&query.path());
            let builder = self
                .reqwest
                .request(query.method(), url)
                .header("X-Sentry-Relay-Id", credentials.id.to_string())
                .header("X-Sentry-Relay-Signature", signature.0.as_str())
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone());

            match self.send(builder).await {
                Ok(response) => {
                    return response
                        .bytes()
                        .await
                        .map_err(UpstreamRequestError::SendFailed);
                }
                Err(error) if error.is_network_error() => {
                    self.notify_network_error();

                    let delay = backoff.next_backoff();
                    if Instant::now() + delay >= deadline {
                        return Err(error);
                    }

                    relay_log::debug!(
                        "upstream query failed, retrying in {delay:?}: {}",
                        LogError(&error)
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Executes a raw request without retries.
    async fn execute_request(self: &Arc<Self>, mut request: Box<dyn UpstreamRequest>) {
        let url = self.config.upstream_descriptor().get_url(&request.path());
        let builder = request.build(self.reqwest.request(request.method(), url));

        let result = self.send(builder).await;
        if let Err(error) = &result {
            if error.is_network_error() {
                self.notify_network_error();
            }
        }

        request.respond(result).await;
    }
}

/// Service implementing the [`UpstreamRelay`] interface.
pub struct UpstreamRelayService {
    config: Arc<Config>,
}

impl UpstreamRelayService {
    /// Creates a new upstream service for the given upstream descriptor.
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl Service for UpstreamRelayService {
    type Interface = UpstreamRelay;

    fn spawn_handler(self, mut rx: relay_system::Receiver<Self::Interface>) {
        let client = Arc::new(SharedClient::new(self.config.clone()));
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_requests()));

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    UpstreamRelay::IsNetworkOutage(sender) => {
                        sender.send(client.outage.load(Ordering::SeqCst));
                    }
                    UpstreamRelay::Query(query) => {
                        let Ok(permit) = semaphore.clone().acquire_owned().await else {
                            break;
                        };

                        let client = Arc::clone(&client);
                        tokio::spawn(async move {
                            let result = client.execute_query(&*query).await;
                            query.respond(result);
                            drop(permit);
                        });
                    }
                    UpstreamRelay::Request(request) => {
                        let Ok(permit) = semaphore.clone().acquire_owned().await else {
                            break;
                        };

                        let client = Arc::clone(&client);
                        tokio::spawn(async move {
                            client.execute_request(request).await;
                            drop(permit);
                        });
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_error(status: u16) -> UpstreamRequestError {
        UpstreamRequestError::ResponseError(
            StatusCode::from_u16(status).unwrap(),
            ApiErrorResponse::default(),
        )
    }

    #[test]
    fn test_gateway_errors_are_network_errors() {
        assert!(response_error(502).is_network_error());
        assert!(response_error(503).is_network_error());
        assert!(response_error(504).is_network_error());
        assert!(!response_error(500).is_network_error());
        assert!(!response_error(400).is_network_error());
    }

    #[test]
    fn test_client_errors_are_permanent() {
        assert!(response_error(400).is_permanent_rejection());
        assert!(response_error(403).is_permanent_rejection());
        assert!(!response_error(500).is_permanent_rejection());
        assert!(!UpstreamRequestError::ChannelClosed.is_permanent_rejection());
    }
}
