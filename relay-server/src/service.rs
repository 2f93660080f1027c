use std::sync::Arc;

use relay_config::Config;
use relay_system::{Addr, Service};

use crate::services::forwarder::{Forwarder, ForwarderService};
use crate::services::health_check::{HealthCheck, HealthCheckService};
use crate::services::project_cache::{ProjectCache, ProjectCacheService};
use crate::services::project_upstream::UpstreamProjectSourceService;
use crate::services::upstream::{UpstreamRelay, UpstreamRelayService};

/// Addresses of all running services.
#[derive(Clone, Debug)]
struct Registry {
    health_check: Addr<HealthCheck>,
    upstream_relay: Addr<UpstreamRelay>,
    project_cache: Addr<ProjectCache>,
    forwarder: Addr<Forwarder>,
}

/// Shared server state passed to all endpoints.
#[derive(Clone, Debug)]
pub struct ServiceState {
    config: Arc<Config>,
    registry: Registry,
}

impl ServiceState {
    /// Starts all services and returns the connected state.
    pub fn start(config: Arc<Config>) -> Self {
        let upstream_relay = UpstreamRelayService::new(config.clone()).start();

        let project_source =
            UpstreamProjectSourceService::new(config.clone(), upstream_relay.clone()).start();
        let project_cache = ProjectCacheService::new(config.clone(), project_source).start();

        let forwarder = ForwarderService::new(config.clone(), upstream_relay.clone()).start();

        let health_check = HealthCheckService::new(
            config.clone(),
            upstream_relay.clone(),
            project_cache.clone(),
        )
        .start();

        ServiceState {
            config,
            registry: Registry {
                health_check,
                upstream_relay,
                project_cache,
                forwarder,
            },
        }
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the address of the health check service.
    pub fn health_check(&self) -> &Addr<HealthCheck> {
        &self.registry.health_check
    }

    /// Returns the address of the upstream client service.
    pub fn upstream_relay(&self) -> &Addr<UpstreamRelay> {
        &self.registry.upstream_relay
    }

    /// Returns the address of the project cache service.
    pub fn project_cache(&self) -> &Addr<ProjectCache> {
        &self.registry.project_cache
    }

    /// Returns the address of the forwarder service.
    pub fn forwarder(&self) -> &Addr<Forwarder> {
        &self.registry.forwarder
    }
}
