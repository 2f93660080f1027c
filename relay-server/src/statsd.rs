use relay_statsd::{CounterMetric, GaugeMetric, HistogramMetric, TimerMetric};

/// Counter metrics for the relay server.
pub enum RelayCounters {
    /// Number of events accepted on the store endpoint.
    ///
    /// This metric is tagged with:
    /// - `mode`: the relay mode (`managed` or `proxy`).
    EventAccepted,
    /// Number of events rejected on the store endpoint before queueing.
    ///
    /// This metric is tagged with:
    /// - `reason`: the discard reason.
    EventRejected,
    /// Number of events successfully delivered to the upstream.
    EventForwarded,
    /// Number of accepted events dropped after queueing.
    ///
    /// This metric is tagged with:
    /// - `reason`: `rejected` for permanent upstream rejections, `retry_limit` when the
    ///   maximum number of send attempts was exhausted, `shutdown` for events dropped
    ///   during shutdown.
    EventDropped,
    /// Number of project state fetch requests issued to the upstream source.
    ProjectStateRequest,
    /// Number of times a project state was served from the cache.
    ProjectCacheHit,
    /// Number of times a project state was not available in the cache.
    ProjectCacheMiss,
    /// Number of project states evicted from the cache by the eviction ticker.
    ProjectCacheEviction,
    /// Number of upstream connection failures observed.
    UpstreamNetworkError,
    /// The relay server was started.
    ServerStarting,
}

impl CounterMetric for RelayCounters {
    fn name(&self) -> &'static str {
        match self {
            Self::EventAccepted => "event.accepted",
            Self::EventRejected => "event.rejected",
            Self::EventForwarded => "event.forwarded",
            Self::EventDropped => "event.dropped",
            Self::ProjectStateRequest => "project_state.request",
            Self::ProjectCacheHit => "project_cache.hit",
            Self::ProjectCacheMiss => "project_cache.miss",
            Self::ProjectCacheEviction => "project_cache.eviction",
            Self::UpstreamNetworkError => "upstream.network_errors",
            Self::ServerStarting => "server.starting",
        }
    }
}

/// Timer metrics for the relay server.
pub enum RelayTimers {
    /// Time spent on a single request to the upstream, including the response body.
    ///
    /// This metric is tagged with:
    /// - `result`: `ok` or `error`.
    UpstreamRequestDuration,
    /// Total time from scheduling a project state fetch until states are resolved.
    ProjectStateFetchDuration,
}

impl TimerMetric for RelayTimers {
    fn name(&self) -> &'static str {
        match self {
            Self::UpstreamRequestDuration => "upstream.requests.duration",
            Self::ProjectStateFetchDuration => "project_state.fetch.duration",
        }
    }
}

/// Histogram metrics for the relay server.
pub enum RelayHistograms {
    /// Number of events in a forwarded batch.
    ForwardedBatchSize,
    /// Number of project keys resolved in a single project config query.
    ProjectStatesBatchSize,
}

impl HistogramMetric for RelayHistograms {
    fn name(&self) -> &'static str {
        match self {
            Self::ForwardedBatchSize => "forwarder.batch_size",
            Self::ProjectStatesBatchSize => "project_states.batch_size",
        }
    }
}

/// Gauge metrics for the relay server.
pub enum RelayGauges {
    /// The state of the upstream connection. `0` for normal operation, `1` during a
    /// network outage.
    NetworkOutage,
    /// Number of project states held in the in-memory cache.
    ProjectCacheSize,
}

impl GaugeMetric for RelayGauges {
    fn name(&self) -> &'static str {
        match self {
            Self::NetworkOutage => "upstream.network_outage",
            Self::ProjectCacheSize => "project_cache.size",
        }
    }
}
