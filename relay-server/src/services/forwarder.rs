//! Store-and-forward pipeline for accepted events.
//!
//! Events are collected into one open batch per project key. A batch closes when it reaches
//! `cache.batch_size` events or after `cache.batch_interval`, whichever comes first; an interval
//! of zero dispatches every event immediately. Closed batches queue FIFO per project with a
//! single in-flight send. Transient upstream failures are retried with exponential backoff up to
//! `http.max_send_attempts`, permanent rejections drop the event exactly once. On shutdown, the
//! forwarder flushes its queues within the controller's grace timeout.

use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use relay_common::{ProjectKey, RetryBackoff};
use relay_config::Config;
use relay_log::LogError;
use relay_statsd::metric;
use relay_system::{Addr, Controller, FromMessage, Interface, NoResponse, Service};
use tokio::sync::oneshot;

use crate::envelope::Envelope;
use crate::services::upstream::{
    SendRequest, UpstreamRelay, UpstreamRequest, UpstreamRequestError,
};
use crate::statsd::{RelayCounters, RelayHistograms};
use crate::utils::SleepHandle;

/// Queues an accepted event for delivery to the upstream.
#[derive(Debug)]
pub struct EnqueueEvent(pub Box<Envelope>);

/// Service interface of the forwarder.
#[derive(Debug)]
pub struct Forwarder(EnqueueEvent);

impl Interface for Forwarder {}

impl FromMessage<EnqueueEvent> for Forwarder {
    type Response = NoResponse;

    fn from_message(message: EnqueueEvent, _: ()) -> Self {
        Self(message)
    }
}

/// An event store request forwarded to the upstream with the client's authentication.
struct StoreRequest {
    path: String,
    auth: String,
    content_type: String,
    payload: Bytes,
    sender: oneshot::Sender<Result<(), UpstreamRequestError>>,
}

impl StoreRequest {
    fn new(envelope: &Envelope, sender: oneshot::Sender<Result<(), UpstreamRequestError>>) -> Self {
        Self {
            path: format!("/api/{}/store/", envelope.meta().project_id()),
            auth: envelope.meta().auth_header(),
            content_type: envelope.content_type().to_owned(),
            payload: envelope.payload(),
            sender,
        }
    }
}

impl UpstreamRequest for StoreRequest {
    fn path(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.path)
    }

    fn build(&mut self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("X-Sentry-Auth", &self.auth)
            .header(reqwest::header::CONTENT_TYPE, &self.content_type)
            .body(self.payload.clone())
    }

    fn respond(
        self: Box<Self>,
        result: Result<reqwest::Response, UpstreamRequestError>,
    ) -> BoxFuture<'static, ()> {
        async move {
            self.sender.send(result.map(drop)).ok();
        }
        .boxed()
    }
}

/// A batch still collecting events.
struct OpenBatch {
    events: Vec<Box<Envelope>>,
    close_at: Instant,
}

/// A closed batch waiting to be sent.
struct Batch {
    events: VecDeque<Box<Envelope>>,
    attempts: u32,
    backoff: RetryBackoff,
    /// Set when the batch waits out a retry delay.
    next_attempt: Option<Instant>,
}

impl Batch {
    fn new(events: VecDeque<Box<Envelope>>, max_retry_interval: Duration) -> Self {
        Self {
            events,
            attempts: 0,
            backoff: RetryBackoff::new(max_retry_interval),
            next_attempt: None,
        }
    }
}

/// Retry state of the batch currently being sent.
struct InFlight {
    attempts: u32,
    backoff: RetryBackoff,
}

#[derive(Default)]
struct ProjectQueue {
    open: Option<OpenBatch>,
    pending: VecDeque<Batch>,
    in_flight: Option<InFlight>,
}

/// Completion of a batch send: remaining events and the error that interrupted the send, if any.
type SendOutcome = (
    ProjectKey,
    VecDeque<Box<Envelope>>,
    Result<(), UpstreamRequestError>,
);

/// Sends the events of one batch in order.
///
/// Stops at the first transient failure, returning the unsent remainder for retry. Permanent
/// rejections drop the affected event and continue with the next one.
fn send_batch(
    upstream_relay: Addr<UpstreamRelay>,
    project_key: ProjectKey,
    mut events: VecDeque<Box<Envelope>>,
) -> BoxFuture<'static, SendOutcome> {
    async move {
        while let Some(envelope) = events.front() {
            let (tx, rx) = oneshot::channel();
            upstream_relay.send(SendRequest(StoreRequest::new(envelope, tx)));

            let result = match rx.await {
                Ok(result) => result,
                Err(_) => Err(UpstreamRequestError::ChannelClosed),
            };

            match result {
                Ok(()) => {
                    metric!(counter(RelayCounters::EventForwarded) += 1);
                    events.pop_front();
                }
                Err(error) if error.is_permanent_rejection() => {
                    relay_log::warn!(
                        "dropping event {}: {}",
                        envelope.event_id(),
                        LogError(&error)
                    );
                    metric!(counter(RelayCounters::EventDropped) += 1, reason = "rejected");
                    events.pop_front();
                }
                Err(error) => return (project_key, events, Err(error)),
            }
        }

        (project_key, events, Ok(()))
    }
    .boxed()
}

/// Service implementing the [`Forwarder`] interface.
pub struct ForwarderService {
    config: Arc<Config>,
    upstream_relay: Addr<UpstreamRelay>,
    queues: HashMap<ProjectKey, ProjectQueue>,
    sends: FuturesUnordered<BoxFuture<'static, SendOutcome>>,
    timer: SleepHandle,
}

impl ForwarderService {
    /// Creates a new forwarder delivering through the given upstream client.
    pub fn new(config: Arc<Config>, upstream_relay: Addr<UpstreamRelay>) -> Self {
        Self {
            config,
            upstream_relay,
            queues: HashMap::new(),
            sends: FuturesUnordered::new(),
            timer: SleepHandle::idle(),
        }
    }

    fn handle_enqueue(&mut self, envelope: Box<Envelope>) {
        let project_key = envelope.meta().public_key();
        let batch_interval = self.config.batch_interval();
        let batch_size = self.config.batch_size().max(1);
        let max_retry_interval = self.config.http_max_retry_interval();

        let queue = self.queues.entry(project_key).or_default();

        if batch_interval.is_zero() {
            let events = VecDeque::from(vec![envelope]);
            queue.pending.push_back(Batch::new(events, max_retry_interval));
            self.try_send(project_key);
            return;
        }

        let open = queue.open.get_or_insert_with(|| OpenBatch {
            events: Vec::new(),
            close_at: Instant::now() + batch_interval,
        });
        open.events.push(envelope);

        if open.events.len() >= batch_size {
            if let Some(open) = queue.open.take() {
                queue
                    .pending
                    .push_back(Batch::new(open.events.into(), max_retry_interval));
            }
            self.try_send(project_key);
        }

        self.reset_timer();
    }

    /// Starts sending the head batch of the queue unless one is already in flight.
    fn try_send(&mut self, project_key: ProjectKey) {
        let Some(queue) = self.queues.get_mut(&project_key) else {
            return;
        };

        if queue.in_flight.is_some() {
            return;
        }

        let ready = queue
            .pending
            .front()
            .is_some_and(|batch| batch.next_attempt.map_or(true, |at| at <= Instant::now()));
        if !ready {
            return;
        }

        let Some(batch) = queue.pending.pop_front() else {
            return;
        };

        queue.in_flight = Some(InFlight {
            attempts: batch.attempts,
            backoff: batch.backoff,
        });

        metric!(histogram(RelayHistograms::ForwardedBatchSize) = batch.events.len() as u64);
        self.sends.push(send_batch(
            self.upstream_relay.clone(),
            project_key,
            batch.events,
        ));
    }

    fn handle_send_outcome(&mut self, outcome: SendOutcome) {
        let (project_key, remaining, result) = outcome;

        let Some(queue) = self.queues.get_mut(&project_key) else {
            return;
        };
        let Some(mut in_flight) = queue.in_flight.take() else {
            return;
        };

        match result {
            Ok(()) => {
                self.try_send(project_key);
            }
            Err(error) => {
                in_flight.attempts += 1;

                if in_flight.attempts >= self.config.http_max_send_attempts() {
                    relay_log::error!(
                        "dropping batch of {} events after {} attempts: {}",
                        remaining.len(),
                        in_flight.attempts,
                        LogError(&error)
                    );
                    metric!(
                        counter(RelayCounters::EventDropped) += remaining.len() as i64,
                        reason = "retry_limit"
                    );
                    self.try_send(project_key);
                } else {
                    let delay = in_flight.backoff.next_backoff();
                    relay_log::debug!(
                        "batch send failed (attempt {}), retrying in {delay:?}: {}",
                        in_flight.attempts,
                        LogError(&error)
                    );

                    queue.pending.push_front(Batch {
                        events: remaining,
                        attempts: in_flight.attempts,
                        backoff: in_flight.backoff,
                        next_attempt: Some(Instant::now() + delay),
                    });
                    self.reset_timer();
                }
            }
        }
    }

    /// Closes due open batches, clears elapsed retry delays and dispatches ready batches.
    fn handle_timer(&mut self) {
        self.timer.reset();
        let now = Instant::now();
        let max_retry_interval = self.config.http_max_retry_interval();

        let keys: Vec<_> = self.queues.keys().copied().collect();
        for project_key in keys {
            let Some(queue) = self.queues.get_mut(&project_key) else {
                continue;
            };

            if queue.open.as_ref().is_some_and(|open| open.close_at <= now) {
                if let Some(open) = queue.open.take() {
                    queue
                        .pending
                        .push_back(Batch::new(open.events.into(), max_retry_interval));
                }
            }

            if let Some(batch) = queue.pending.front_mut() {
                if batch.next_attempt.is_some_and(|at| at <= now) {
                    batch.next_attempt = None;
                }
            }

            self.try_send(project_key);
        }

        self.reset_timer();
    }

    /// Arms the timer for the earliest batch deadline or retry time.
    fn reset_timer(&mut self) {
        let mut earliest: Option<Instant> = None;
        for queue in self.queues.values() {
            if let Some(open) = &queue.open {
                earliest = Some(earliest.map_or(open.close_at, |e| e.min(open.close_at)));
            }

            if queue.in_flight.is_none() {
                if let Some(at) = queue.pending.front().and_then(|batch| batch.next_attempt) {
                    earliest = Some(earliest.map_or(at, |e| e.min(at)));
                }
            }
        }

        match earliest {
            Some(at) => self
                .timer
                .set(at.saturating_duration_since(Instant::now())),
            None => self.timer.reset(),
        }
    }

    /// Drains pending batches within the shutdown grace timeout.
    async fn flush(&mut self, grace: Option<Duration>) {
        let max_retry_interval = self.config.http_max_retry_interval();
        let keys: Vec<_> = self.queues.keys().copied().collect();

        for project_key in &keys {
            if let Some(queue) = self.queues.get_mut(project_key) {
                if let Some(open) = queue.open.take() {
                    queue
                        .pending
                        .push_back(Batch::new(open.events.into(), max_retry_interval));
                }
            }
        }

        if let Some(grace) = grace {
            let deadline = tokio::time::sleep(grace);
            tokio::pin!(deadline);

            loop {
                // Retry delays do not apply during shutdown; the grace timeout bounds us.
                for project_key in &keys {
                    if let Some(queue) = self.queues.get_mut(project_key) {
                        if let Some(batch) = queue.pending.front_mut() {
                            batch.next_attempt = None;
                        }
                    }
                    self.try_send(*project_key);
                }

                if self.sends.is_empty() {
                    break;
                }

                tokio::select! {
                    Some(outcome) = self.sends.next() => self.handle_send_outcome(outcome),
                    _ = &mut deadline => break,
                }
            }
        }

        let remaining: usize = self
            .queues
            .values()
            .map(|queue| {
                queue.pending.iter().map(|batch| batch.events.len()).sum::<usize>()
                    + queue.open.as_ref().map_or(0, |open| open.events.len())
            })
            .sum();

        if remaining > 0 {
            relay_log::error!("dropping {remaining} queued events at shutdown");
            metric!(
                counter(RelayCounters::EventDropped) += remaining as i64,
                reason = "shutdown"
            );
        }
    }
}

impl Service for ForwarderService {
    type Interface = Forwarder;

    fn spawn_handler(mut self, mut rx: relay_system::Receiver<Self::Interface>) {
        tokio::spawn(async move {
            let mut shutdown = Controller::shutdown_handle();

            loop {
                tokio::select! {
                    biased;

                    Some(outcome) = self.sends.next(), if !self.sends.is_empty() => {
                        self.handle_send_outcome(outcome);
                    }
                    Some(Forwarder(EnqueueEvent(envelope))) = rx.recv() => {
                        self.handle_enqueue(envelope);
                    }
                    () = &mut self.timer => self.handle_timer(),
                    shutdown = shutdown.notified() => {
                        self.flush(shutdown.timeout).await;
                        break;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use relay_common::{ProjectId, ProjectKey};
    use relay_system::Service;

    use crate::extractors::RequestMeta;

    use super::*;

    fn test_config(values: serde_json::Value) -> Arc<Config> {
        Arc::new(Config::from_json_value(values).unwrap())
    }

    fn test_envelope() -> Box<Envelope> {
        let meta = RequestMeta::for_test(
            ProjectId::new(42),
            ProjectKey::parse("31a5a894b4524f74a9a8d0e27e21ba91").unwrap(),
        );
        Envelope::from_request(
            meta,
            "application/json".to_owned(),
            Bytes::from_static(br#"{"message":"hello"}"#),
        )
        .unwrap()
    }

    fn ok_response() -> reqwest::Response {
        axum::http::Response::new("".to_owned()).into()
    }

    fn rejection(status: u16) -> UpstreamRequestError {
        UpstreamRequestError::ResponseError(
            reqwest::StatusCode::from_u16(status).unwrap(),
            Default::default(),
        )
    }

    async fn expect_store_request(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<UpstreamRelay>,
    ) -> Box<dyn UpstreamRequest> {
        match rx.recv().await.unwrap() {
            UpstreamRelay::Request(request) => request,
            other => panic!("expected store request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_zero_interval_sends_immediately() {
        let (upstream, mut upstream_rx) = Addr::custom();
        let config = test_config(serde_json::json!({"cache": {"batch_interval": 0}}));
        let forwarder = ForwarderService::new(config, upstream).start();

        forwarder.send(EnqueueEvent(test_envelope()));

        let request = expect_store_request(&mut upstream_rx).await;
        assert_eq!(request.path(), "/api/42/store/");
        request.respond(Ok(ok_response())).await;
    }

    #[tokio::test]
    async fn test_batch_closes_on_size() {
        let (upstream, mut upstream_rx) = Addr::custom();
        let config = test_config(serde_json::json!({
            "cache": {"batch_interval": 60000, "batch_size": 2}
        }));
        let forwarder = ForwarderService::new(config, upstream).start();

        forwarder.send(EnqueueEvent(test_envelope()));
        forwarder.send(EnqueueEvent(test_envelope()));

        // The batch closes on the second event, long before the interval elapses. Events of
        // the batch are delivered in order.
        let first = expect_store_request(&mut upstream_rx).await;
        first.respond(Ok(ok_response())).await;
        let second = expect_store_request(&mut upstream_rx).await;
        second.respond(Ok(ok_response())).await;

        assert!(upstream_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_permanent_rejection_drops_once() {
        relay_log::init_test();

        let (upstream, mut upstream_rx) = Addr::custom();
        let config = test_config(serde_json::json!({"cache": {"batch_interval": 0}}));
        let forwarder = ForwarderService::new(config, upstream).start();

        forwarder.send(EnqueueEvent(test_envelope()));

        let request = expect_store_request(&mut upstream_rx).await;
        request.respond(Err(rejection(403))).await;

        // The event is not retried.
        forwarder.send(EnqueueEvent(test_envelope()));
        let next = expect_store_request(&mut upstream_rx).await;
        next.respond(Ok(ok_response())).await;
        assert!(upstream_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_transient_failure_retries_until_limit() {
        relay_log::init_test();

        let (upstream, mut upstream_rx) = Addr::custom();
        let config = test_config(serde_json::json!({
            "cache": {"batch_interval": 0},
            "http": {"max_send_attempts": 2}
        }));
        let forwarder = ForwarderService::new(config, upstream).start();

        forwarder.send(EnqueueEvent(test_envelope()));

        // First attempt fails with a server error, the batch is retried.
        let request = expect_store_request(&mut upstream_rx).await;
        request.respond(Err(rejection(500))).await;

        let retry = expect_store_request(&mut upstream_rx).await;
        retry.respond(Err(rejection(500))).await;

        // The attempt limit is reached; the batch is dropped and nothing is retried.
        forwarder.send(EnqueueEvent(test_envelope()));
        let next = expect_store_request(&mut upstream_rx).await;
        next.respond(Ok(ok_response())).await;
        assert!(upstream_rx.try_recv().is_err());
    }
}
