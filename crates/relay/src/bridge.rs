// Relay bridge: every event goes out over the bus, and everything that comes
// back in on `doc:*` is fanned out locally. Nothing is dispatched straight
// from a connection task, so single- and multi-process runs share one path.

use std::future::Future;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use futures_util::StreamExt;
use marginalia_common::protocol::ws::{decode_event, encode_event, PresenceEvent};
use marginalia_common::types::RoomId;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{Bus, BusError, BusMessage, BusSubscription, ROOM_TOPIC_PATTERN};
use crate::dispatch::Dispatcher;
use crate::metrics::RelayMetrics;

/// A bus event waiting for the dispatch worker.
#[derive(Debug)]
struct DispatchJob {
    room: RoomId,
    event: PresenceEvent,
}

/// Wait between resubscribe attempts after the bus subscription is lost.
/// Starts at `initial` and doubles per failed attempt, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResubscribeBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for ResubscribeBackoff {
    fn default() -> Self {
        Self { initial: Duration::from_millis(500), max: Duration::from_secs(30) }
    }
}

impl ResubscribeBackoff {
    fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

#[derive(Clone)]
pub struct RelayBridge {
    bus: Bus,
    metrics: Arc<RelayMetrics>,
    backoff: ResubscribeBackoff,
    subscribed: Arc<AtomicBool>,
}

impl RelayBridge {
    pub fn new(bus: Bus, metrics: Arc<RelayMetrics>) -> Self {
        Self {
            bus,
            metrics,
            backoff: ResubscribeBackoff::default(),
            subscribed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_resubscribe_backoff(mut self, backoff: ResubscribeBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Whether this process is currently receiving room events from the bus.
    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    /// Publish `event` on the room's topic. Failures are logged and counted;
    /// the event is lost.
    pub async fn publish(&self, room: &RoomId, event: &PresenceEvent) {
        let payload = match encode_event(event) {
            Ok(payload) => payload,
            Err(error) => {
                error!(room = %room, event_type = event.kind(), error = %error, "failed to encode event for publish");
                self.metrics.record_publish_failure();
                return;
            }
        };

        match self.bus.publish(room.as_str(), payload).await {
            Ok(()) => self.metrics.record_published(event.kind()),
            Err(error) => {
                warn!(
                    room = %room,
                    peer = %event.origin(),
                    event_type = event.kind(),
                    error = %error,
                    "bus publish failed, event lost"
                );
                self.metrics.record_publish_failure();
            }
        }
    }

    /// Subscribe to every room topic and start feeding the dispatcher.
    ///
    /// The subscription is established before this returns, so events
    /// published afterwards are never missed by this process. A subscription
    /// lost later is re-established in the background with backoff; events
    /// published while it is down are not recovered.
    pub async fn start(
        &self,
        dispatcher: Dispatcher,
        queue_capacity: usize,
    ) -> Result<BridgeTasks, BusError> {
        let subscription = self.bus.subscribe(ROOM_TOPIC_PATTERN).await?;
        self.subscribed.store(true, Ordering::SeqCst);
        let (jobs_tx, jobs_rx) = mpsc::channel(queue_capacity.max(1));

        info!(
            backend = self.bus.backend(),
            pattern = ROOM_TOPIC_PATTERN,
            queue_capacity,
            "relay bridge subscribed"
        );

        let subscriber_loop = SubscriberLoop {
            jobs: jobs_tx,
            metrics: Arc::clone(&self.metrics),
            subscribed: Arc::clone(&self.subscribed),
            backoff: self.backoff,
        };
        let bus = self.bus.clone();
        let resubscribe = move || {
            let bus = bus.clone();
            async move { bus.subscribe(ROOM_TOPIC_PATTERN).await }
        };

        let subscriber = tokio::spawn(subscriber_loop.run(subscription, resubscribe));
        let worker = tokio::spawn(run_dispatch_worker(jobs_rx, dispatcher));
        Ok(BridgeTasks { subscriber, worker, subscribed: Arc::clone(&self.subscribed) })
    }
}

/// Background tasks owned by a started bridge.
pub struct BridgeTasks {
    subscriber: JoinHandle<()>,
    worker: JoinHandle<()>,
    subscribed: Arc<AtomicBool>,
}

impl BridgeTasks {
    pub fn abort(&self) {
        self.subscriber.abort();
        self.worker.abort();
        self.subscribed.store(false, Ordering::SeqCst);
    }
}

impl Drop for BridgeTasks {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Moves bus messages onto the dispatch queue, resubscribing whenever the
/// subscription stream ends.
struct SubscriberLoop {
    jobs: mpsc::Sender<DispatchJob>,
    metrics: Arc<RelayMetrics>,
    subscribed: Arc<AtomicBool>,
    backoff: ResubscribeBackoff,
}

impl SubscriberLoop {
    async fn run<F, Fut>(self, mut subscription: BusSubscription, mut resubscribe: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<BusSubscription, BusError>>,
    {
        loop {
            if !self.forward(&mut subscription).await {
                debug!("dispatch worker stopped, ending bus subscription");
                return;
            }

            self.subscribed.store(false, Ordering::SeqCst);
            warn!(
                pattern = ROOM_TOPIC_PATTERN,
                "bus subscription lost, room events are dropped until it is restored"
            );

            let Some(restored) = self.resubscribe(&mut resubscribe).await else {
                debug!("dispatch worker stopped while resubscribing");
                return;
            };
            subscription = restored;
            self.subscribed.store(true, Ordering::SeqCst);
            self.metrics.record_bus_resubscribe();
            info!(pattern = ROOM_TOPIC_PATTERN, "bus subscription restored");
        }
    }

    /// Returns `false` once the dispatch worker is gone, `true` when the
    /// subscription itself ended.
    async fn forward(&self, subscription: &mut BusSubscription) -> bool {
        while let Some(message) = subscription.next().await {
            let Some(job) = decode_bus_message(&message, &self.metrics) else {
                continue;
            };

            match self.jobs.try_send(job) {
                Ok(()) => {}
                Err(TrySendError::Full(job)) => {
                    self.metrics.record_dispatch_queue_overflow();
                    warn!(
                        room = %job.room,
                        event_type = job.event.kind(),
                        "dispatch queue full, dropping bus event"
                    );
                }
                Err(TrySendError::Closed(_)) => return false,
            }
        }
        true
    }

    async fn resubscribe<F, Fut>(&self, resubscribe: &mut F) -> Option<BusSubscription>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<BusSubscription, BusError>>,
    {
        let mut delay = self.backoff.initial;
        let mut attempt = 0u32;
        loop {
            tokio::time::sleep(delay).await;
            if self.jobs.is_closed() {
                return None;
            }

            attempt += 1;
            match resubscribe().await {
                Ok(subscription) => return Some(subscription),
                Err(error) => {
                    delay = self.backoff.next_delay(delay);
                    warn!(
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %error,
                        "bus resubscribe failed"
                    );
                }
            }
        }
    }
}

fn decode_bus_message(message: &BusMessage, metrics: &RelayMetrics) -> Option<DispatchJob> {
    let Some(room) = RoomId::from_topic(&message.topic) else {
        warn!(topic = %message.topic, "ignoring bus message on non-room topic");
        metrics.record_decode_failure("bus");
        return None;
    };

    match decode_event(&message.payload) {
        Ok(event) => Some(DispatchJob { room, event }),
        Err(error) => {
            warn!(room = %room, error = %error, "dropping undecodable bus payload");
            metrics.record_decode_failure("bus");
            None
        }
    }
}

async fn run_dispatch_worker(mut jobs: mpsc::Receiver<DispatchJob>, dispatcher: Dispatcher) {
    while let Some(job) = jobs.recv().await {
        let report = dispatcher.dispatch(&job.room, &job.event).await;
        debug!(
            room = %job.room,
            event_type = job.event.kind(),
            delivered = report.delivered,
            dropped = report.dropped,
            "dispatched bus event"
        );
    }
}
