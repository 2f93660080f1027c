use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use relay_config::{Config, RelayMode};
use relay_system::{
    Addr, AsyncResponse, Controller, FromMessage, Interface, Sender, Service,
};
use serde::Serialize;

use crate::services::project_cache::{CacheReady, ProjectCache};
use crate::services::upstream::{IsNetworkOutage, UpstreamRelay};

/// Checks whether the relay is healthy.
#[derive(Clone, Copy, Debug)]
pub struct IsHealthy;

/// Returns the individual health flags.
#[derive(Clone, Copy, Debug)]
pub struct GetHealthDetail;

/// The health flags reported by [`GetHealthDetail`].
///
/// The relay is healthy iff all flags are set.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct HealthDetail {
    /// Credentials are loaded, or not required in proxy mode.
    pub credentials_loaded: bool,
    /// The upstream is not in a network outage.
    pub upstream_reachable: bool,
    /// The project cache service is up and responding.
    pub cache_initialized: bool,
}

impl HealthDetail {
    /// Returns `true` if all health flags are set.
    pub fn healthy(&self) -> bool {
        self.credentials_loaded && self.upstream_reachable && self.cache_initialized
    }
}

/// Service interface for health checks.
#[derive(Debug)]
pub enum HealthCheck {
    IsHealthy(Sender<bool>),
    Detail(Sender<HealthDetail>),
}

impl Interface for HealthCheck {}

impl FromMessage<IsHealthy> for HealthCheck {
    type Response = AsyncResponse<bool>;

    fn from_message(_: IsHealthy, sender: Sender<bool>) -> Self {
        Self::IsHealthy(sender)
    }
}

impl FromMessage<GetHealthDetail> for HealthCheck {
    type Response = AsyncResponse<HealthDetail>;

    fn from_message(_: GetHealthDetail, sender: Sender<HealthDetail>) -> Self {
        Self::Detail(sender)
    }
}

/// Service implementing the [`HealthCheck`] interface.
///
/// The handler performs no I/O. Upstream reachability is a flag maintained by the upstream
/// service's probe loop, and the cache is considered initialized when its service responds.
#[derive(Debug)]
pub struct HealthCheckService {
    is_shutting_down: AtomicBool,
    config: Arc<Config>,
    upstream_relay: Addr<UpstreamRelay>,
    project_cache: Addr<ProjectCache>,
}

impl HealthCheckService {
    /// Creates a new health check service.
    pub fn new(
        config: Arc<Config>,
        upstream_relay: Addr<UpstreamRelay>,
        project_cache: Addr<ProjectCache>,
    ) -> Self {
        Self {
            is_shutting_down: AtomicBool::new(false),
            config,
            upstream_relay,
            project_cache,
        }
    }

    async fn health_detail(&self) -> HealthDetail {
        let credentials_loaded = match self.config.relay_mode() {
            RelayMode::Managed => self.config.has_credentials(),
            RelayMode::Proxy => true,
        };

        let is_outage = self
            .upstream_relay
            .send(IsNetworkOutage)
            .await
            .unwrap_or(true);

        let cache_initialized = self.project_cache.send(CacheReady).await.unwrap_or(false);

        HealthDetail {
            credentials_loaded,
            upstream_reachable: !is_outage,
            cache_initialized,
        }
    }

    async fn handle_message(&self, message: HealthCheck) {
        match message {
            HealthCheck::IsHealthy(sender) => {
                if self.is_shutting_down.load(Ordering::Relaxed) {
                    sender.send(false);
                } else {
                    sender.send(self.health_detail().await.healthy());
                }
            }
            HealthCheck::Detail(sender) => {
                sender.send(self.health_detail().await);
            }
        }
    }
}

impl Service for HealthCheckService {
    type Interface = HealthCheck;

    fn spawn_handler(self, mut rx: relay_system::Receiver<Self::Interface>) {
        let service = Arc::new(self);

        tokio::spawn(async move {
            let mut shutdown = Controller::shutdown_handle();

            loop {
                tokio::select! {
                    biased;

                    Some(message) = rx.recv() => {
                        let service = service.clone();
                        tokio::spawn(async move { service.handle_message(message).await });
                    }
                    _ = shutdown.notified() => {
                        service.is_shutting_down.store(true, Ordering::Relaxed);
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(values: serde_json::Value) -> Arc<Config> {
        Arc::new(Config::from_json_value(values).unwrap())
    }

    #[tokio::test]
    async fn test_unhealthy_without_credentials() {
        // Stopped peer services count as unreachable and uninitialized.
        let upstream = Addr::dummy();
        let cache = Addr::dummy();

        let service =
            HealthCheckService::new(test_config(serde_json::json!({})), upstream, cache).start();

        // Managed mode without credentials reports unhealthy.
        assert_eq!(service.send(IsHealthy).await, Ok(false));
    }

    #[tokio::test]
    async fn test_healthy_in_proxy_mode() {
        let (upstream, mut upstream_rx) = Addr::custom();
        let (cache, mut cache_rx) = Addr::custom();

        let config = test_config(serde_json::json!({"relay": {"mode": "proxy"}}));
        let service = HealthCheckService::new(config, upstream, cache).start();

        let request = service.send(GetHealthDetail);

        // Answer the flag lookups of the handler.
        match upstream_rx.recv().await.unwrap() {
            UpstreamRelay::IsNetworkOutage(sender) => sender.send(false),
            other => panic!("unexpected message {other:?}"),
        }
        match cache_rx.recv().await.unwrap() {
            ProjectCache::Ready(sender) => sender.send(true),
            other => panic!("unexpected message {other:?}"),
        }

        let detail = request.await.unwrap();
        assert!(detail.credentials_loaded);
        assert!(detail.upstream_reachable);
        assert!(detail.cache_initialized);
        assert!(detail.healthy());
    }
}
