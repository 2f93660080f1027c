//! The relay server application.
//!
//! This crate contains the [`run`] function which starts the relay server. The server accepts
//! telemetry events on the store endpoint, validates them against per-project configuration
//! fetched from the upstream, and forwards accepted events upstream in batches.
//!
//! # Path of an event through the relay
//!
//! A store request is authenticated and parsed in the endpoint, then checked against the cached
//! project state. The response confirms acceptance into the forwarding queue; delivery happens
//! asynchronously with bounded retries. Project states are fetched lazily through batched,
//! signed queries against the upstream and cached with expiry and a grace period.

mod endpoints;
mod envelope;
mod extractors;
mod service;
mod services;
mod statsd;
mod utils;

use std::net::SocketAddr;
use std::sync::Arc;

use relay_config::Config;
use relay_statsd::metric;
use relay_system::Controller;

use crate::statsd::RelayCounters;

pub use crate::service::ServiceState;

/// Runs the relay server until shutdown.
///
/// Creates the tokio runtime, installs the signal handlers, starts all services and serves HTTP
/// until a shutdown signal arrives. Blocks the calling thread until the server has stopped.
pub fn run(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    metric!(counter(RelayCounters::ServerStarting) += 1);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("relay-server")
        .enable_all()
        .build()?;

    runtime.block_on(async {
        Controller::start(config.shutdown_timeout());
        let state = ServiceState::start(config.clone());

        let app = endpoints::routes(&config)
            .with_state(state)
            .into_make_service_with_connect_info::<SocketAddr>();

        let listener = tokio::net::TcpListener::bind(config.listen_addr()).await?;
        relay_log::info!("spawning http server, listening on {}", config.listen_addr());

        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                Controller::shutdown_handle().notified().await;
            })
            .await?;

        anyhow::Ok(())
    })?;

    relay_log::info!("relay shutdown complete");
    Ok(())
}
