//! Typed dispatch of incoming bus messages to registered handlers.
//!
//! A single loop reads messages sequentially: decode → dedup → pattern
//! match → concurrent fan-out. Handler failures are caught, logged with
//! the message's correlation id, and counted; they never terminate the
//! loop. Registrations marked dedup-exempt (the health registry, the
//! character store) see every arrival, including retained re-deliveries
//! whose envelope ids repeat.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tars_contracts::{topic_matches, Envelope};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::DedupConfig;
use crate::dedup::DedupCache;
use crate::error::RouterError;
use crate::metrics::{names, Metrics};
use crate::traits::Publish;

/// One message delivered by the broker client.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
}

/// Per-message context passed into every handler.
#[derive(Clone)]
pub struct Ctx {
    /// Topic the message arrived on.
    pub topic: String,
    /// Correlation id of the message, if any. Every log line a handler
    /// emits should carry it.
    pub correlate: Option<String>,
    /// Shared publisher handle.
    pub publisher: Arc<dyn Publish>,
    pub metrics: Metrics,
    /// Global shutdown signal; handlers observe it at I/O boundaries.
    pub shutdown: watch::Receiver<bool>,
}

/// Boxed async handler: `(ctx, envelope) → Result`.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), RouterError>> + Send>>;
pub type Handler = Arc<dyn Fn(Ctx, Envelope) -> HandlerFuture + Send + Sync>;

struct Registration {
    pattern: String,
    name: &'static str,
    handler: Handler,
    dedup_exempt: bool,
}

/// Topic-to-handler registry and dispatch loop.
pub struct Dispatcher {
    registrations: Vec<Registration>,
    dedup: DedupCache,
    publisher: Arc<dyn Publish>,
    metrics: Metrics,
    handler_timeout: Duration,
    grace: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    pub fn new(
        publisher: Arc<dyn Publish>,
        metrics: Metrics,
        dedup: &DedupConfig,
        handler_timeout: Duration,
        grace: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registrations: Vec::new(),
            dedup: DedupCache::new(dedup.ttl, dedup.max_entries),
            publisher,
            metrics,
            handler_timeout,
            grace,
            shutdown,
        }
    }

    /// Register a handler for a topic pattern (`+`/`#` wildcards).
    /// Multiple handlers per pattern run in registration order.
    pub fn register(&mut self, pattern: impl Into<String>, name: &'static str, handler: Handler) {
        self.registrations.push(Registration {
            pattern: pattern.into(),
            name,
            handler,
            dedup_exempt: false,
        });
    }

    /// Register a handler that bypasses the dedup gate. Used for
    /// retained-topic consumers whose state must survive reconnect
    /// re-deliveries.
    pub fn register_exempt(
        &mut self,
        pattern: impl Into<String>,
        name: &'static str,
        handler: Handler,
    ) {
        self.registrations.push(Registration {
            pattern: pattern.into(),
            name,
            handler,
            dedup_exempt: true,
        });
    }

    /// Run the dispatch loop until shutdown or the incoming channel
    /// closes, then drain in-flight handlers up to the grace period and
    /// cancel the rest.
    pub async fn run(self, mut incoming: mpsc::Receiver<IncomingMessage>) {
        let mut shutdown = self.shutdown.clone();
        let mut tasks: JoinSet<()> = JoinSet::new();

        info!(
            registrations = self.registrations.len(),
            "dispatcher started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                maybe = incoming.recv() => {
                    match maybe {
                        Some(message) => self.dispatch(message, &mut tasks),
                        None => {
                            debug!("incoming channel closed");
                            break;
                        }
                    }
                }
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    Self::reap(result, &self.metrics);
                }
            }
        }

        self.drain(tasks).await;
        info!("dispatcher stopped");
    }

    /// Decode, dedup, match, and fan out one message.
    fn dispatch(&self, message: IncomingMessage, tasks: &mut JoinSet<()>) {
        let started = Instant::now();
        let topic = message.topic.as_str();
        self.metrics.incr(names::MESSAGES_RECEIVED, topic);

        if message.payload.is_empty() {
            // Retained-topic clear; service disappearance is handled by
            // the health registry's staleness sweep.
            debug!(topic, "empty payload skipped");
            return;
        }

        let envelope = match Envelope::decode_typed(&message.payload) {
            Ok((envelope, _payload)) => envelope,
            Err(e) => {
                warn!(topic, error = %e, "dropping undecodable message");
                self.metrics.incr(names::PROTOCOL_ERRORS, topic);
                return;
            }
        };

        let matching: Vec<&Registration> = self
            .registrations
            .iter()
            .filter(|r| topic_matches(&r.pattern, topic))
            .collect();
        if matching.is_empty() {
            debug!(topic, "no handler registered");
            return;
        }

        // The dedup gate applies once per message, but only to gated
        // registrations; exempt ones run regardless.
        let any_gated = matching.iter().any(|r| !r.dedup_exempt);
        let fresh = !any_gated || self.dedup.insert_if_fresh(&envelope.id);
        if !fresh {
            self.metrics.incr(names::DEDUP_HITS, "");
            debug!(topic, id = %envelope.id, "duplicate delivery suppressed");
        }

        let ctx = Ctx {
            topic: message.topic.clone(),
            correlate: envelope.correlate.clone(),
            publisher: self.publisher.clone(),
            metrics: self.metrics.clone(),
            shutdown: self.shutdown.clone(),
        };

        let mut dispatched = false;
        for registration in matching {
            if !fresh && !registration.dedup_exempt {
                continue;
            }
            dispatched = true;
            self.spawn_handler(registration, ctx.clone(), envelope.clone(), tasks);
        }

        if dispatched {
            self.metrics.incr(names::MESSAGES_DISPATCHED, topic);
            self.metrics.observe(
                names::DISPATCH_LATENCY_MS,
                topic,
                started.elapsed().as_secs_f64() * 1000.0,
            );
        }
    }

    fn spawn_handler(
        &self,
        registration: &Registration,
        ctx: Ctx,
        envelope: Envelope,
        tasks: &mut JoinSet<()>,
    ) {
        let handler = registration.handler.clone();
        let name = registration.name;
        let timeout = self.handler_timeout;
        let metrics = self.metrics.clone();

        tasks.spawn(async move {
            let topic = ctx.topic.clone();
            let correlate = ctx.correlate.clone().unwrap_or_default();
            let started = Instant::now();

            let result = tokio::time::timeout(timeout, (handler)(ctx, envelope)).await;

            metrics.observe(
                names::HANDLER_LATENCY_MS,
                &topic,
                started.elapsed().as_secs_f64() * 1000.0,
            );

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        handler = name,
                        topic = %topic,
                        correlate = %correlate,
                        error = %e,
                        "handler failed"
                    );
                    metrics.incr(names::HANDLER_ERRORS, &topic);
                }
                Err(_) => {
                    warn!(
                        handler = name,
                        topic = %topic,
                        correlate = %correlate,
                        timeout = ?timeout,
                        "handler timed out, cancelled"
                    );
                    metrics.incr(names::HANDLER_ERRORS, &topic);
                }
            }
        });
    }

    fn reap(result: Result<(), tokio::task::JoinError>, metrics: &Metrics) {
        if let Err(e) = result {
            if e.is_panic() {
                error!(error = %e, "handler task panicked");
                metrics.incr(names::HANDLER_ERRORS, "panic");
            }
        }
    }

    async fn drain(&self, mut tasks: JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }
        info!(in_flight = tasks.len(), "draining in-flight handlers");
        let deadline = Instant::now() + self.grace;

        while !tasks.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(remaining_tasks = tasks.len(), "grace period over, cancelling handlers");
                tasks.abort_all();
                break;
            }
            match tokio::time::timeout(remaining, tasks.join_next()).await {
                Ok(Some(result)) => Self::reap(result, &self.metrics),
                Ok(None) => break,
                Err(_) => {
                    warn!(remaining_tasks = tasks.len(), "grace period over, cancelling handlers");
                    tasks.abort_all();
                    break;
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingPublisher;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tars_contracts::events::{EventPayload, TtsControl, TtsAction, WakeEvent, WakeKind};

    fn counting_handler(counter: Arc<AtomicUsize>) -> Handler {
        Arc::new(move |_ctx, _env| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    fn wake_envelope() -> Envelope {
        Envelope::new(
            "wake",
            &EventPayload::WakeEvent(WakeEvent {
                kind: WakeKind::Wake,
                cause: None,
                confidence: None,
                energy: None,
            }),
            None,
        )
        .unwrap()
    }

    fn message(topic: &str, envelope: &Envelope) -> IncomingMessage {
        IncomingMessage {
            topic: topic.to_string(),
            payload: Bytes::from(envelope.encode().unwrap()),
            retain: false,
        }
    }

    struct Harness {
        tx: mpsc::Sender<IncomingMessage>,
        shutdown: watch::Sender<bool>,
        metrics: Metrics,
        handle: tokio::task::JoinHandle<()>,
    }

    fn start(build: impl FnOnce(&mut Dispatcher)) -> Harness {
        start_with_timeout(build, Duration::from_secs(5))
    }

    fn start_with_timeout(
        build: impl FnOnce(&mut Dispatcher),
        handler_timeout: Duration,
    ) -> Harness {
        let publisher = Arc::new(RecordingPublisher::new());
        let metrics = Metrics::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut dispatcher = Dispatcher::new(
            publisher as Arc<dyn Publish>,
            metrics.clone(),
            &DedupConfig::default(),
            handler_timeout,
            Duration::from_millis(500),
            shutdown_rx,
        );
        build(&mut dispatcher);

        let (tx, rx) = mpsc::channel(32);
        let handle = tokio::spawn(dispatcher.run(rx));
        Harness {
            tx,
            shutdown: shutdown_tx,
            metrics,
            handle,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn routes_to_matching_handler() {
        let count = Arc::new(AtomicUsize::new(0));
        let other = Arc::new(AtomicUsize::new(0));
        let harness = start(|d| {
            d.register("wake/event", "wake", counting_handler(count.clone()));
            d.register("tts/status", "tts", counting_handler(other.clone()));
        });

        harness
            .tx
            .send(message("wake/event", &wake_envelope()))
            .await
            .unwrap();
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(other.load(Ordering::SeqCst), 0);
        assert_eq!(harness.metrics.counter(names::MESSAGES_DISPATCHED, "wake/event"), 1);
    }

    #[tokio::test]
    async fn wildcard_pattern_matches() {
        let count = Arc::new(AtomicUsize::new(0));
        let harness = start(|d| {
            d.register_exempt("system/health/+", "health", counting_handler(count.clone()));
        });

        let envelope = Envelope::new(
            "llm",
            &EventPayload::HealthStatus(tars_contracts::events::HealthStatus {
                ok: true,
                event: None,
                err: None,
            }),
            None,
        )
        .unwrap();
        harness
            .tx
            .send(message("system/health/llm", &envelope))
            .await
            .unwrap();
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_ids_invoke_handler_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let harness = start(|d| {
            d.register("wake/event", "wake", counting_handler(count.clone()));
        });

        let envelope = wake_envelope();
        harness.tx.send(message("wake/event", &envelope)).await.unwrap();
        harness.tx.send(message("wake/event", &envelope)).await.unwrap();
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(harness.metrics.counter(names::DEDUP_HITS, ""), 1);
    }

    #[tokio::test]
    async fn exempt_handler_sees_duplicates() {
        let gated = Arc::new(AtomicUsize::new(0));
        let exempt = Arc::new(AtomicUsize::new(0));
        let harness = start(|d| {
            d.register("wake/event", "gated", counting_handler(gated.clone()));
            d.register_exempt("wake/event", "exempt", counting_handler(exempt.clone()));
        });

        let envelope = wake_envelope();
        harness.tx.send(message("wake/event", &envelope)).await.unwrap();
        harness.tx.send(message("wake/event", &envelope)).await.unwrap();
        settle().await;

        assert_eq!(gated.load(Ordering::SeqCst), 1);
        assert_eq!(exempt.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn distinct_ids_each_invoke_handler() {
        let count = Arc::new(AtomicUsize::new(0));
        let harness = start(|d| {
            d.register("wake/event", "wake", counting_handler(count.clone()));
        });

        for _ in 0..5 {
            harness
                .tx
                .send(message("wake/event", &wake_envelope()))
                .await
                .unwrap();
        }
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn handler_error_does_not_stop_the_loop() {
        let count = Arc::new(AtomicUsize::new(0));
        let failing: Handler = Arc::new(|_ctx, _env| {
            Box::pin(async {
                Err(RouterError::Invariant("boom".into()))
            })
        });
        let harness = start(|d| {
            d.register("wake/event", "failing", failing);
            d.register("wake/event", "counting", counting_handler(count.clone()));
        });

        harness
            .tx
            .send(message("wake/event", &wake_envelope()))
            .await
            .unwrap();
        harness
            .tx
            .send(message("wake/event", &wake_envelope()))
            .await
            .unwrap();
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(
            harness.metrics.counter(names::HANDLER_ERRORS, "wake/event"),
            2
        );
    }

    #[tokio::test]
    async fn slow_handler_is_cancelled_on_timeout() {
        let slow: Handler = Arc::new(|_ctx, _env| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
        });
        let count = Arc::new(AtomicUsize::new(0));
        let harness = start_with_timeout(
            |d| {
                d.register("wake/event", "slow", slow);
                d.register("wake/event", "fast", counting_handler(count.clone()));
            },
            Duration::from_millis(50),
        );

        harness
            .tx
            .send(message("wake/event", &wake_envelope()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(
            harness.metrics.counter(names::HANDLER_ERRORS, "wake/event"),
            1
        );
    }

    #[tokio::test]
    async fn malformed_payload_is_counted_and_skipped() {
        let count = Arc::new(AtomicUsize::new(0));
        let harness = start(|d| {
            d.register("wake/event", "wake", counting_handler(count.clone()));
        });

        harness
            .tx
            .send(IncomingMessage {
                topic: "wake/event".into(),
                payload: Bytes::from_static(b"{not json"),
                retain: false,
            })
            .await
            .unwrap();
        // A well-formed envelope with an unregistered type is dropped too.
        harness
            .tx
            .send(IncomingMessage {
                topic: "wake/event".into(),
                payload: Bytes::from(
                    serde_json::to_vec(&serde_json::json!({
                        "id": "aaaa",
                        "type": "wake.event.v9",
                        "ts": 1.0,
                        "source": "wake",
                        "data": {}
                    }))
                    .unwrap(),
                ),
                retain: false,
            })
            .await
            .unwrap();
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(
            harness.metrics.counter(names::PROTOCOL_ERRORS, "wake/event"),
            2
        );
    }

    #[tokio::test]
    async fn empty_payload_is_skipped_quietly() {
        let count = Arc::new(AtomicUsize::new(0));
        let harness = start(|d| {
            d.register_exempt("system/health/+", "health", counting_handler(count.clone()));
        });

        harness
            .tx
            .send(IncomingMessage {
                topic: "system/health/tts".into(),
                payload: Bytes::new(),
                retain: true,
            })
            .await
            .unwrap();
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(
            harness
                .metrics
                .counter(names::PROTOCOL_ERRORS, "system/health/tts"),
            0
        );
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let count = Arc::new(AtomicUsize::new(0));
        let harness = start(|d| {
            d.register("wake/event", "wake", counting_handler(count.clone()));
        });

        harness.shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), harness.handle)
            .await
            .expect("dispatcher should stop promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn handlers_can_publish_through_ctx() {
        let publisher = Arc::new(RecordingPublisher::new());
        let metrics = Metrics::new();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut dispatcher = Dispatcher::new(
            publisher.clone() as Arc<dyn Publish>,
            metrics.clone(),
            &DedupConfig::default(),
            Duration::from_secs(5),
            Duration::from_millis(500),
            shutdown_rx,
        );

        let echo: Handler = Arc::new(|ctx, env| {
            Box::pin(async move {
                ctx.publisher
                    .publish_event(
                        "router",
                        "tts/control",
                        &EventPayload::TtsControl(TtsControl {
                            action: TtsAction::Stop,
                        }),
                        env.correlate.clone(),
                        rumqttc::QoS::AtLeastOnce,
                        false,
                    )
                    .await?;
                Ok(())
            })
        });
        dispatcher.register("wake/event", "echo", echo);

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(dispatcher.run(rx));

        tx.send(message("wake/event", &wake_envelope())).await.unwrap();
        let records = publisher
            .wait_for("tts/control", 1, Duration::from_secs(2))
            .await;
        assert_eq!(records.len(), 1);
    }
}
