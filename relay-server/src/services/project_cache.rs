//! In-memory cache for project states.
//!
//! The cache is the only consumer of the upstream project source. It serves fresh states
//! directly, serves stale states within the grace period while refreshing in the background,
//! and parks callers on a shared channel while a state is expired or missing. Entries idle past
//! expiry are dropped by a periodic eviction tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use relay_common::ProjectKey;
use relay_config::Config;
use relay_statsd::metric;
use relay_system::{
    Addr, AsyncResponse, BroadcastChannel, BroadcastResponse, BroadcastSender, FromMessage,
    Interface, Sender, Service,
};

use crate::services::project::ProjectState;
use crate::services::project_upstream::{FetchProjectState, UpstreamProjectSource};
use crate::statsd::{RelayCounters, RelayGauges};

/// Returns the project state for the given key, fetching it if necessary.
///
/// Resolves once a state is available. While a fetch is in flight, all requests for the same key
/// share it.
#[derive(Debug)]
pub struct GetProjectState {
    /// The public key of the project.
    pub project_key: ProjectKey,
}

/// Returns the cached project state without triggering I/O.
///
/// `None` means the project is not in the cache.
#[derive(Debug)]
pub struct GetCachedProjectState {
    /// The public key of the project.
    pub project_key: ProjectKey,
}

/// Liveness probe of the cache used by the health check.
#[derive(Debug)]
pub struct CacheReady;

/// Service interface of the project cache.
#[derive(Debug)]
pub enum ProjectCache {
    Get(GetProjectState, BroadcastSender<Arc<ProjectState>>),
    GetCached(GetCachedProjectState, Sender<Option<Arc<ProjectState>>>),
    Ready(Sender<bool>),
}

impl Interface for ProjectCache {}

impl FromMessage<GetProjectState> for ProjectCache {
    type Response = BroadcastResponse<Arc<ProjectState>>;

    fn from_message(message: GetProjectState, sender: BroadcastSender<Arc<ProjectState>>) -> Self {
        Self::Get(message, sender)
    }
}

impl FromMessage<GetCachedProjectState> for ProjectCache {
    type Response = AsyncResponse<Option<Arc<ProjectState>>>;

    fn from_message(
        message: GetCachedProjectState,
        sender: Sender<Option<Arc<ProjectState>>>,
    ) -> Self {
        Self::GetCached(message, sender)
    }
}

impl FromMessage<CacheReady> for ProjectCache {
    type Response = AsyncResponse<bool>;

    fn from_message(_: CacheReady, sender: Sender<bool>) -> Self {
        Self::Ready(sender)
    }
}

/// Freshness of a cached project state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Expiry {
    /// The state is fresh and can be served.
    Updated,
    /// The state is expired but within the grace period; serve it and refresh in background.
    Stale,
    /// The state is expired past the grace period or was never fetched; callers wait.
    Expired,
}

/// A cache entry for one project key.
#[derive(Debug, Default)]
struct Project {
    state: Option<Arc<ProjectState>>,
    last_fetched: Option<Instant>,
    /// Set while a refresh for this key is in flight.
    fetching: bool,
    /// Requests waiting for the next state.
    channel: Option<BroadcastChannel<Arc<ProjectState>>>,
}

/// Service implementing the [`ProjectCache`] interface.
pub struct ProjectCacheService {
    config: Arc<Config>,
    source: Addr<UpstreamProjectSource>,
    projects: HashMap<ProjectKey, Project>,
    fetches: FuturesUnordered<BoxFuture<'static, (ProjectKey, Arc<ProjectState>)>>,
}

impl ProjectCacheService {
    /// Creates a new project cache reading states through the given source.
    pub fn new(config: Arc<Config>, source: Addr<UpstreamProjectSource>) -> Self {
        Self {
            config,
            source,
            projects: HashMap::new(),
            fetches: FuturesUnordered::new(),
        }
    }

    fn check_expiry(&self, project: &Project) -> Expiry {
        let Some(last_fetched) = project.last_fetched else {
            return Expiry::Expired;
        };

        let expiry = match &project.state {
            Some(state) if state.is_missing() || state.invalid() => {
                self.config.cache_miss_expiry()
            }
            _ => self.config.project_cache_expiry(),
        };

        let elapsed = last_fetched.elapsed();
        if elapsed >= expiry + self.config.project_grace_period() {
            Expiry::Expired
        } else if elapsed >= expiry {
            Expiry::Stale
        } else {
            Expiry::Updated
        }
    }

    fn schedule_fetch(&mut self, project_key: ProjectKey) {
        let project = self.projects.entry(project_key).or_default();
        if project.fetching {
            return;
        }
        project.fetching = true;

        let request = self.source.send(FetchProjectState { project_key });
        self.fetches.push(
            async move {
                let state = match request.await {
                    Ok(state) => state,
                    // The source stopped; degrade to an error state instead of hanging waiters.
                    Err(_) => Arc::new(ProjectState::err()),
                };
                (project_key, state)
            }
            .boxed(),
        );
    }

    fn handle_get(&mut self, message: GetProjectState, sender: BroadcastSender<Arc<ProjectState>>) {
        let GetProjectState { project_key } = message;
        let expiry = match self.projects.get(&project_key) {
            Some(project) => self.check_expiry(project),
            None => Expiry::Expired,
        };

        let project = self.projects.entry(project_key).or_default();
        match (expiry, project.state.clone()) {
            (Expiry::Updated, Some(state)) => {
                metric!(counter(RelayCounters::ProjectCacheHit) += 1);
                sender.send(state);
            }
            (Expiry::Stale, Some(state)) => {
                metric!(counter(RelayCounters::ProjectCacheHit) += 1);
                sender.send(state);
                self.schedule_fetch(project_key);
            }
            _ => {
                metric!(counter(RelayCounters::ProjectCacheMiss) += 1);
                project
                    .channel
                    .get_or_insert_with(BroadcastChannel::new)
                    .attach(sender);
                self.schedule_fetch(project_key);
            }
        }
    }

    fn handle_get_cached(
        &self,
        message: GetCachedProjectState,
        sender: Sender<Option<Arc<ProjectState>>>,
    ) {
        let state = self
            .projects
            .get(&message.project_key)
            .filter(|project| self.check_expiry(project) != Expiry::Expired)
            .and_then(|project| project.state.clone());

        sender.send(state);
    }

    fn handle_fetch_complete(&mut self, project_key: ProjectKey, state: Arc<ProjectState>) {
        let project = self.projects.entry(project_key).or_default();
        project.state = Some(state.clone());
        project.last_fetched = Some(Instant::now());
        project.fetching = false;

        if let Some(channel) = project.channel.take() {
            channel.send(state);
        }
    }

    fn evict_stale_projects(&mut self) {
        let eviction_start = Instant::now();
        let expiry = self.config.project_cache_expiry() + self.config.project_grace_period();

        let before = self.projects.len();
        self.projects.retain(|_, project| {
            if project.fetching || project.channel.is_some() {
                return true;
            }

            match project.last_fetched {
                Some(last_fetched) => eviction_start - last_fetched < expiry,
                None => false,
            }
        });

        let evicted = before - self.projects.len();
        if evicted > 0 {
            relay_log::debug!("evicted {evicted} stale projects from the cache");
            metric!(counter(RelayCounters::ProjectCacheEviction) += evicted as i64);
        }

        metric!(gauge(RelayGauges::ProjectCacheSize) = self.projects.len() as u64);
    }

    fn handle_message(&mut self, message: ProjectCache) {
        match message {
            ProjectCache::Get(message, sender) => self.handle_get(message, sender),
            ProjectCache::GetCached(message, sender) => self.handle_get_cached(message, sender),
            ProjectCache::Ready(sender) => sender.send(true),
        }
    }
}

impl Service for ProjectCacheService {
    type Interface = ProjectCache;

    fn spawn_handler(mut self, mut rx: relay_system::Receiver<Self::Interface>) {
        tokio::spawn(async move {
            let mut eviction_ticker =
                tokio::time::interval(self.config.cache_eviction_interval());
            eviction_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    Some((project_key, state)) = self.fetches.next(), if !self.fetches.is_empty() => {
                        self.handle_fetch_complete(project_key, state);
                    }
                    Some(message) = rx.recv() => self.handle_message(message),
                    _ = eviction_ticker.tick() => self.evict_stale_projects(),

                    else => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use relay_common::ProjectId;
    use relay_system::Service;

    use super::*;

    fn test_key() -> ProjectKey {
        ProjectKey::parse("31a5a894b4524f74a9a8d0e27e21ba91").unwrap()
    }

    fn enabled_state() -> ProjectState {
        let mut state = ProjectState::missing();
        state.project_id = Some(ProjectId::new(42));
        state.disabled = false;
        state.public_keys.insert(test_key(), true);
        state
    }

    fn test_config() -> Arc<Config> {
        Arc::new(Config::from_json_value(serde_json::json!({})).unwrap())
    }

    #[tokio::test]
    async fn test_miss_fetches_once_and_caches() {
        let (source, mut source_rx) = Addr::custom();
        let cache = ProjectCacheService::new(test_config(), source).start();

        let first = cache.send(GetProjectState { project_key: test_key() });
        let second = cache.send(GetProjectState { project_key: test_key() });

        // Both requests collapse into a single fetch.
        let UpstreamProjectSource(fetch, sender) = source_rx.recv().await.unwrap();
        assert_eq!(fetch.project_key, test_key());
        sender.send(Arc::new(enabled_state()));
        assert!(source_rx.try_recv().is_err());

        assert!(!first.await.unwrap().disabled);
        assert!(!second.await.unwrap().disabled);

        // A third request is served from the cache without a fetch.
        let third = cache.send(GetProjectState { project_key: test_key() });
        assert!(!third.await.unwrap().disabled);
        assert!(source_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cached_lookup_does_not_fetch() {
        let (source, mut source_rx) = Addr::custom();
        let cache = ProjectCacheService::new(test_config(), source).start();

        let state = cache
            .send(GetCachedProjectState { project_key: test_key() })
            .await
            .unwrap();

        assert!(state.is_none());
        assert!(source_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_state_served_while_refreshing() {
        // With a zero expiry, the state turns stale right after the first fetch but stays
        // within the grace period.
        let config = Arc::new(
            Config::from_json_value(serde_json::json!({
                "cache": {"project_expiry": 0, "project_grace_period": 60}
            }))
            .unwrap(),
        );

        let (source, mut source_rx) = Addr::custom();
        let cache = ProjectCacheService::new(config, source).start();

        let first = cache.send(GetProjectState { project_key: test_key() });
        let UpstreamProjectSource(_, sender) = source_rx.recv().await.unwrap();
        sender.send(Arc::new(enabled_state()));
        assert!(!first.await.unwrap().disabled);

        // The stale state is served without waiting for the refresh.
        let stale = cache
            .send(GetProjectState { project_key: test_key() })
            .await
            .unwrap();
        assert!(!stale.disabled);

        // A background refresh was scheduled for the same key.
        let UpstreamProjectSource(fetch, sender) = source_rx.recv().await.unwrap();
        assert_eq!(fetch.project_key, test_key());
        sender.send(Arc::new(enabled_state()));
    }

    #[tokio::test]
    async fn test_failed_source_degrades_to_error_state() {
        let (source, mut source_rx) = Addr::custom();
        let cache = ProjectCacheService::new(test_config(), source).start();

        let request = cache.send(GetProjectState { project_key: test_key() });

        // Drop the fetch sender without responding.
        let UpstreamProjectSource(_, sender) = source_rx.recv().await.unwrap();
        drop(sender);

        let state = request.await.unwrap();
        assert!(state.invalid());
    }
}
