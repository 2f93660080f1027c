//! Fetches project states from the upstream in batched queries.
//!
//! Individual fetch requests are collapsed per project key and collected into a single query of
//! up to `cache.query_batch_size` keys. Failed queries are retried with exponential backoff
//! until `limits.query_timeout` has elapsed for the affected keys, after which waiters receive
//! an invalid state.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use relay_common::{ProjectKey, RetryBackoff};
use relay_config::Config;
use relay_log::LogError;
use relay_statsd::metric;
use relay_system::{
    Addr, BroadcastChannel, BroadcastResponse, BroadcastSender, FromMessage, Interface, Service,
};
use serde::{Deserialize, Serialize};

use crate::services::project::ProjectState;
use crate::services::upstream::{SendQuery, UpstreamQuery, UpstreamRelay, UpstreamRequestError};
use crate::statsd::{RelayCounters, RelayHistograms, RelayTimers};
use crate::utils::SleepHandle;

/// The batched project config query sent to the upstream.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetProjectStates {
    pub public_keys: Vec<ProjectKey>,
}

/// Response to [`GetProjectStates`].
///
/// A `null` config marks a project key the upstream does not know.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetProjectStatesResponse {
    #[serde(default)]
    pub configs: HashMap<ProjectKey, Option<ProjectState>>,
}

impl UpstreamQuery for GetProjectStates {
    type Response = GetProjectStatesResponse;

    fn path(&self) -> Cow<'static, str> {
        Cow::Borrowed("/api/0/relays/projectconfigs/")
    }
}

/// Requests a project state fetch from the upstream.
///
/// Requests for the same key share one response channel and one slot in the next query batch.
#[derive(Debug)]
pub struct FetchProjectState {
    /// The public key for which to fetch the state.
    pub project_key: ProjectKey,
}

/// Service interface of the upstream project source.
pub struct UpstreamProjectSource(pub FetchProjectState, pub BroadcastSender<Arc<ProjectState>>);

impl Interface for UpstreamProjectSource {}

impl FromMessage<FetchProjectState> for UpstreamProjectSource {
    type Response = BroadcastResponse<Arc<ProjectState>>;

    fn from_message(
        message: FetchProjectState,
        sender: BroadcastSender<Arc<ProjectState>>,
    ) -> Self {
        Self(message, sender)
    }
}

/// Collapses fetch requests for one project key.
struct ProjectStateChannel {
    channel: BroadcastChannel<Arc<ProjectState>>,
    deadline: Instant,
}

impl ProjectStateChannel {
    fn new(sender: BroadcastSender<Arc<ProjectState>>, timeout: std::time::Duration) -> Self {
        let mut channel = BroadcastChannel::new();
        channel.attach(sender);

        Self {
            channel,
            deadline: Instant::now() + timeout,
        }
    }

    fn attach(&mut self, sender: BroadcastSender<Arc<ProjectState>>) {
        self.channel.attach(sender);
    }

    fn expired(&self) -> bool {
        Instant::now() > self.deadline
    }

    fn send(self, state: ProjectState) {
        self.channel.send(Arc::new(state));
    }
}

type FetchResult = Result<GetProjectStatesResponse, UpstreamRequestError>;
type BatchResponse = (
    Vec<(ProjectKey, ProjectStateChannel)>,
    FetchResult,
    Instant,
);

/// Service fetching project states through the [`UpstreamRelay`].
pub struct UpstreamProjectSourceService {
    config: Arc<Config>,
    upstream_relay: Addr<UpstreamRelay>,
    channels: HashMap<ProjectKey, ProjectStateChannel>,
    fetches: FuturesUnordered<BoxFuture<'static, BatchResponse>>,
    fetch_handle: SleepHandle,
    backoff: RetryBackoff,
}

impl UpstreamProjectSourceService {
    /// Creates a new project source using the given upstream client.
    pub fn new(config: Arc<Config>, upstream_relay: Addr<UpstreamRelay>) -> Self {
        Self {
            backoff: RetryBackoff::new(config.http_max_retry_interval()),
            config,
            upstream_relay,
            channels: HashMap::new(),
            fetches: FuturesUnordered::new(),
            fetch_handle: SleepHandle::idle(),
        }
    }

    fn handle_message(&mut self, message: UpstreamProjectSource) {
        let UpstreamProjectSource(FetchProjectState { project_key }, sender) = message;

        metric!(counter(RelayCounters::ProjectStateRequest) += 1);

        match self.channels.entry(project_key) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                entry.get_mut().attach(sender);
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(ProjectStateChannel::new(
                    sender,
                    self.config.query_timeout(),
                ));
            }
        }

        self.schedule_fetch();
    }

    /// Schedules the next fetch, debounced by the batch interval or backoff when retrying.
    fn schedule_fetch(&mut self) {
        if !self.fetch_handle.is_idle() {
            return;
        }

        let wait = if self.backoff.started() {
            self.backoff.next_backoff()
        } else {
            self.config.query_batch_interval()
        };

        self.fetch_handle.set(wait);
    }

    fn do_fetch(&mut self) {
        self.fetch_handle.reset();

        if self.channels.is_empty() {
            return;
        }

        let batch_size = self.config.query_batch_size();
        let batch: Vec<_> = {
            let keys: Vec<_> = self.channels.keys().copied().take(batch_size).collect();
            keys.into_iter()
                .filter_map(|key| Some((key, self.channels.remove(&key)?)))
                .collect()
        };

        let query = GetProjectStates {
            public_keys: batch.iter().map(|(key, _)| *key).collect(),
        };

        metric!(
            histogram(RelayHistograms::ProjectStatesBatchSize) = query.public_keys.len() as u64
        );

        let request = self.upstream_relay.send(SendQuery(query));
        let started = Instant::now();

        self.fetches.push(
            async move {
                let result = match request.await {
                    Ok(result) => result,
                    Err(_) => Err(UpstreamRequestError::ChannelClosed),
                };
                (batch, result, started)
            }
            .boxed(),
        );

        // More keys than fit into one batch wait for the next tick.
        if !self.channels.is_empty() {
            self.schedule_fetch();
        }
    }

    fn handle_fetch_result(&mut self, response: BatchResponse) {
        let (batch, result, started) = response;

        match result {
            Ok(mut response) => {
                self.backoff.reset();
                metric!(timer(RelayTimers::ProjectStateFetchDuration) = started.elapsed());

                for (key, channel) in batch {
                    let state = response
                        .configs
                        .remove(&key)
                        .flatten()
                        .unwrap_or_else(ProjectState::missing);
                    channel.send(state);
                }
            }
            Err(error) => {
                relay_log::error!("error fetching project states: {}", LogError(&error));

                // Requests that ran past their deadline resolve with an error state, the rest
                // is retried with backoff.
                for (key, channel) in batch {
                    if channel.expired() {
                        channel.send(ProjectState::err());
                    } else {
                        self.channels.entry(key).or_insert(channel);
                    }
                }

                if !self.channels.is_empty() {
                    self.schedule_fetch();
                }
            }
        }
    }
}

impl Service for UpstreamProjectSourceService {
    type Interface = UpstreamProjectSource;

    fn spawn_handler(mut self, mut rx: relay_system::Receiver<Self::Interface>) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    Some(response) = self.fetches.next(), if !self.fetches.is_empty() => {
                        self.handle_fetch_result(response);
                    }
                    Some(message) = rx.recv() => self.handle_message(message),
                    () = &mut self.fetch_handle => self.do_fetch(),

                    else => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use relay_system::Service;

    use super::*;

    fn test_config() -> Arc<Config> {
        Arc::new(
            Config::from_json_value(serde_json::json!({
                "cache": { "query_batch_interval": 0 }
            }))
            .unwrap(),
        )
    }

    fn test_key() -> ProjectKey {
        ProjectKey::parse("31a5a894b4524f74a9a8d0e27e21ba91").unwrap()
    }

    #[tokio::test]
    async fn test_fetches_are_batched_and_collapsed() {
        let (upstream, mut upstream_rx) = Addr::custom();
        let source = UpstreamProjectSourceService::new(test_config(), upstream).start();

        // Two requests for the same key must result in one upstream query.
        let first = source.send(FetchProjectState { project_key: test_key() });
        let second = source.send(FetchProjectState { project_key: test_key() });

        let query = upstream_rx.recv().await.unwrap();
        let UpstreamRelay::Query(query) = query else {
            panic!("expected a query");
        };

        let body = query.serialize_body().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"publicKeys": ["31a5a894b4524f74a9a8d0e27e21ba91"]})
        );

        // Resolve the query with an existing project.
        let response = serde_json::json!({
            "configs": {
                "31a5a894b4524f74a9a8d0e27e21ba91": {
                    "projectId": 42,
                    "publicKeys": {"31a5a894b4524f74a9a8d0e27e21ba91": true},
                    "disabled": false
                }
            }
        });
        query.respond(Ok(serde_json::to_vec(&response).unwrap().into()));

        let first = first.await.unwrap();
        let second = second.await.unwrap();
        assert_eq!(first.project_id, Some(relay_common::ProjectId::new(42)));
        assert_eq!(second.project_id, Some(relay_common::ProjectId::new(42)));

        // No second query was issued.
        assert!(upstream_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_project_resolves_negative_state() {
        let (upstream, mut upstream_rx) = Addr::custom();
        let source = UpstreamProjectSourceService::new(test_config(), upstream).start();

        let request = source.send(FetchProjectState { project_key: test_key() });

        let UpstreamRelay::Query(query) = upstream_rx.recv().await.unwrap() else {
            panic!("expected a query");
        };
        query.respond(Ok(
            serde_json::to_vec(&serde_json::json!({"configs": {}})).unwrap().into(),
        ));

        let state = request.await.unwrap();
        assert!(state.is_missing());
        assert!(state.disabled);
    }
}
