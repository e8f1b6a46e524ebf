//! Wake-word state machine.
//!
//! Decides whether transcripts are admitted, cancels in-flight work on
//! interruption, and emits microphone-gating commands. All events flow
//! through a single bounded channel, so transitions are total-ordered; a
//! cancel emitted for a prior correlation can never suppress a later
//! session's traffic.
//!
//! The transition logic lives in [`WakeCore`], a pure value type that
//! returns [`WakeEffect`]s; the async [`WakeMachine`] task executes them.

use std::sync::Arc;

use rumqttc::QoS;
use tars_contracts::events::{
    EventPayload, LlmCancel, MicAction, TtsStatusKind, WakeEvent, WakeKind, WakeMic,
};
use tars_contracts::{envelope, topics};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::WakeConfig;
use crate::metrics::{names, Metrics};
use crate::stream::StreamAssembler;
use crate::traits::Publish;

/// Capacity of the machine's input channel.
const INPUT_CAPACITY: usize = 64;

// ── States and snapshots ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeState {
    Idle,
    Listening,
    Responding,
}

impl WakeState {
    /// Numeric value for the wake-state gauge.
    pub fn gauge_value(self) -> f64 {
        match self {
            Self::Idle => 0.0,
            Self::Listening => 1.0,
            Self::Responding => 2.0,
        }
    }
}

/// Read-only view of the machine, published through a watch channel.
#[derive(Debug, Clone)]
pub struct WakeSnapshot {
    pub state: WakeState,
    pub session_id: Option<String>,
    pub active_correlate: Option<String>,
    pub always_listen: bool,
}

impl WakeSnapshot {
    /// Whether final transcripts should be considered for routing.
    pub fn admits_transcripts(&self) -> bool {
        self.always_listen || self.state != WakeState::Idle
    }
}

// ── Inputs and effects ───────────────────────────────────────────────

/// Everything the machine reacts to.
#[derive(Debug)]
pub enum WakeInput {
    /// A `wake.event` arrival.
    Wake(WakeEvent),
    /// Transcript activity (partial or final) — resets the idle timer.
    Transcript,
    /// A stream delta arrived for the given correlation.
    StreamDelta { correlate: String },
    /// A `tts.status` arrival.
    TtsStatus(TtsStatusKind),
    /// An `llm.request` went out with this correlation id.
    SetActive { correlate: String },
    /// Explicit stop: cancel in-flight work and close the session.
    Stop,
}

/// Side effects requested by the pure core, executed by the task.
#[derive(Debug, Clone, PartialEq)]
pub enum WakeEffect {
    /// Publish `wake.mic` with the given action and optional TTL.
    Mic(MicAction, Option<u64>),
    /// Publish `wake.event{type:"timeout", cause:"silence"}`.
    AnnounceTimeout,
    /// Publish `llm.cancel{correlate}` and cancel the stream buffer.
    CancelActive { correlate: String },
}

// ── Pure core ────────────────────────────────────────────────────────

/// Pure transition logic. Holds the session and the active correlation;
/// every mutation happens through [`WakeCore::on_input`] or
/// [`WakeCore::on_idle_expired`] with an explicit clock.
#[derive(Debug)]
pub struct WakeCore {
    config: WakeConfig,
    state: WakeState,
    session_id: Option<String>,
    active: Option<String>,
    last_wake: Option<Instant>,
    idle_deadline: Option<Instant>,
}

impl WakeCore {
    pub fn new(config: WakeConfig) -> Self {
        let state = if config.always_listen {
            WakeState::Listening
        } else {
            WakeState::Idle
        };
        let session_id = config.always_listen.then(envelope::fresh_id);
        Self {
            config,
            state,
            session_id,
            active: None,
            last_wake: None,
            idle_deadline: None,
        }
    }

    pub fn state(&self) -> WakeState {
        self.state
    }

    pub fn idle_deadline(&self) -> Option<Instant> {
        self.idle_deadline
    }

    pub fn snapshot(&self) -> WakeSnapshot {
        WakeSnapshot {
            state: self.state,
            session_id: self.session_id.clone(),
            active_correlate: self.active.clone(),
            always_listen: self.config.always_listen,
        }
    }

    pub fn on_input(&mut self, input: WakeInput, now: Instant) -> Vec<WakeEffect> {
        match input {
            WakeInput::Wake(event) => self.on_wake(event, now),
            WakeInput::Transcript => {
                if self.state != WakeState::Idle {
                    self.reset_idle(now);
                }
                Vec::new()
            }
            WakeInput::StreamDelta { correlate } => self.on_stream_delta(correlate, now),
            WakeInput::TtsStatus(kind) => self.on_tts_status(kind, now),
            WakeInput::SetActive { correlate } => {
                self.active = Some(correlate);
                if self.state != WakeState::Idle {
                    self.reset_idle(now);
                }
                Vec::new()
            }
            WakeInput::Stop => self.on_stop(),
        }
    }

    /// The idle timer fired.
    pub fn on_idle_expired(&mut self, _now: Instant) -> Vec<WakeEffect> {
        self.idle_deadline = None;
        if self.config.always_listen || self.state == WakeState::Idle {
            return Vec::new();
        }

        let mut effects = Vec::new();
        if let Some(correlate) = self.active.take() {
            effects.push(WakeEffect::CancelActive { correlate });
        }
        effects.push(WakeEffect::AnnounceTimeout);
        effects.push(WakeEffect::Mic(MicAction::Mute, None));

        self.state = WakeState::Idle;
        self.session_id = None;
        effects
    }

    fn on_wake(&mut self, event: WakeEvent, now: Instant) -> Vec<WakeEffect> {
        match event.kind {
            WakeKind::Wake => {
                if self.config.always_listen {
                    return Vec::new();
                }
                match self.state {
                    WakeState::Idle | WakeState::Listening => {
                        // Open a session, or supersede the current one.
                        self.state = WakeState::Listening;
                        self.session_id = Some(envelope::fresh_id());
                        self.last_wake = Some(now);
                        self.reset_idle(now);
                        vec![WakeEffect::Mic(MicAction::Unmute, Some(self.idle_ttl_ms()))]
                    }
                    WakeState::Responding => {
                        let within_window = self
                            .last_wake
                            .is_some_and(|w| now.duration_since(w) <= self.config.interrupt_window);
                        self.last_wake = Some(now);
                        self.reset_idle(now);
                        if within_window {
                            // Barge-in: kill the current response, keep listening.
                            self.state = WakeState::Listening;
                            match self.active.take() {
                                Some(correlate) => vec![WakeEffect::CancelActive { correlate }],
                                None => Vec::new(),
                            }
                        } else {
                            Vec::new()
                        }
                    }
                }
            }
            WakeKind::Timeout => {
                // External (or looped-back) session close.
                if self.config.always_listen || self.state == WakeState::Idle {
                    return Vec::new();
                }
                self.state = WakeState::Idle;
                self.session_id = None;
                self.active = None;
                self.idle_deadline = None;
                vec![WakeEffect::Mic(MicAction::Mute, None)]
            }
        }
    }

    fn on_stream_delta(&mut self, correlate: String, now: Instant) -> Vec<WakeEffect> {
        if self.active.as_deref() != Some(correlate.as_str()) {
            // Stale chunk from a superseded correlation.
            return Vec::new();
        }
        if self.state == WakeState::Listening {
            self.state = WakeState::Responding;
        }
        self.reset_idle(now);
        Vec::new()
    }

    fn on_tts_status(&mut self, kind: TtsStatusKind, now: Instant) -> Vec<WakeEffect> {
        match kind {
            TtsStatusKind::SpeakingEnd | TtsStatusKind::Error => {
                if self.state == WakeState::Responding {
                    self.state = WakeState::Listening;
                    self.active = None;
                }
                if self.state != WakeState::Idle {
                    self.reset_idle(now);
                }
            }
            TtsStatusKind::SpeakingStart => {
                if self.state != WakeState::Idle {
                    self.reset_idle(now);
                }
            }
        }
        Vec::new()
    }

    fn on_stop(&mut self) -> Vec<WakeEffect> {
        let mut effects = Vec::new();
        if let Some(correlate) = self.active.take() {
            effects.push(WakeEffect::CancelActive { correlate });
        }
        if self.config.always_listen {
            self.idle_deadline = None;
            return effects;
        }
        if self.state != WakeState::Idle {
            effects.push(WakeEffect::Mic(MicAction::Mute, None));
        }
        self.state = WakeState::Idle;
        self.session_id = None;
        self.idle_deadline = None;
        effects
    }

    fn reset_idle(&mut self, now: Instant) {
        self.idle_deadline = if self.config.always_listen {
            None
        } else {
            Some(now + self.config.idle_timeout)
        };
    }

    fn idle_ttl_ms(&self) -> u64 {
        self.config.idle_timeout.as_millis() as u64
    }
}

// ── Async machine ────────────────────────────────────────────────────

/// Handle for feeding the machine and reading its state.
#[derive(Clone)]
pub struct WakeHandle {
    tx: mpsc::Sender<WakeInput>,
    snapshot: watch::Receiver<WakeSnapshot>,
}

impl WakeHandle {
    /// Queue an input. The machine's channel is bounded; if the machine
    /// is gone (shutdown) the input is dropped with a warning.
    pub async fn send(&self, input: WakeInput) {
        if self.tx.send(input).await.is_err() {
            warn!("wake machine is gone, dropping input");
        }
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> WakeSnapshot {
        self.snapshot.borrow().clone()
    }
}

/// Task wrapper around [`WakeCore`]: serializes inputs, runs the idle
/// timer, executes effects against the publisher and stream assembler.
pub struct WakeMachine {
    core: WakeCore,
    rx: mpsc::Receiver<WakeInput>,
    snapshot_tx: watch::Sender<WakeSnapshot>,
    publisher: Arc<dyn Publish>,
    assembler: Arc<StreamAssembler>,
    metrics: Metrics,
    shutdown: watch::Receiver<bool>,
}

impl WakeMachine {
    pub fn new(
        config: WakeConfig,
        publisher: Arc<dyn Publish>,
        assembler: Arc<StreamAssembler>,
        metrics: Metrics,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, WakeHandle) {
        let core = WakeCore::new(config);
        let (tx, rx) = mpsc::channel(INPUT_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(core.snapshot());
        let machine = Self {
            core,
            rx,
            snapshot_tx,
            publisher,
            assembler,
            metrics,
            shutdown,
        };
        let handle = WakeHandle {
            tx,
            snapshot: snapshot_rx,
        };
        (machine, handle)
    }

    /// Run until shutdown. Inputs are processed one at a time.
    pub async fn run(mut self) {
        self.publish_state();
        loop {
            let deadline = self.core.idle_deadline();
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                maybe = self.rx.recv() => {
                    match maybe {
                        Some(input) => {
                            let now = Instant::now();
                            let effects = self.core.on_input(input, now);
                            self.finish_step(effects).await;
                        }
                        None => break,
                    }
                }
                _ = idle_sleep(deadline), if deadline.is_some() => {
                    debug!("wake session idle timeout");
                    let effects = self.core.on_idle_expired(Instant::now());
                    self.finish_step(effects).await;
                }
            }
        }
        debug!("wake machine stopped");
    }

    async fn finish_step(&mut self, effects: Vec<WakeEffect>) {
        // Snapshot first: readers must never observe an effect (mic
        // unmute, cancel) ahead of the state that produced it.
        self.publish_state();
        for effect in effects {
            self.run_effect(effect).await;
        }
    }

    fn publish_state(&self) {
        self.metrics
            .set_gauge(names::WAKE_STATE, "", self.core.state().gauge_value());
        let _ = self.snapshot_tx.send_replace(self.core.snapshot());
    }

    async fn run_effect(&self, effect: WakeEffect) {
        match effect {
            WakeEffect::Mic(action, ttl_ms) => {
                let payload = EventPayload::WakeMic(WakeMic { action, ttl_ms });
                if let Err(e) = self
                    .publisher
                    .publish_event(
                        crate::SERVICE_NAME,
                        topics::WAKE_MIC,
                        &payload,
                        None,
                        QoS::AtLeastOnce,
                        false,
                    )
                    .await
                {
                    warn!(error = %e, "failed to publish wake.mic");
                }
            }
            WakeEffect::AnnounceTimeout => {
                let payload = EventPayload::WakeEvent(WakeEvent {
                    kind: WakeKind::Timeout,
                    cause: Some("silence".into()),
                    confidence: None,
                    energy: None,
                });
                if let Err(e) = self
                    .publisher
                    .publish_event(
                        crate::SERVICE_NAME,
                        topics::WAKE_EVENT,
                        &payload,
                        None,
                        QoS::AtLeastOnce,
                        false,
                    )
                    .await
                {
                    warn!(error = %e, "failed to publish wake timeout event");
                }
            }
            WakeEffect::CancelActive { correlate } => {
                let payload = EventPayload::LlmCancel(LlmCancel {
                    reason: Some("interrupted".into()),
                });
                if let Err(e) = self
                    .publisher
                    .publish_event(
                        crate::SERVICE_NAME,
                        topics::LLM_CANCEL,
                        &payload,
                        Some(correlate.clone()),
                        QoS::AtLeastOnce,
                        false,
                    )
                    .await
                {
                    warn!(correlate = %correlate, error = %e, "failed to publish llm.cancel");
                }
                self.assembler.cancel(&correlate).await;
            }
        }
    }
}

async fn idle_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        // Guarded out by the caller's `if deadline.is_some()`.
        None => std::future::pending::<()>().await,
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> WakeConfig {
        WakeConfig {
            always_listen: false,
            idle_timeout: Duration::from_secs(30),
            interrupt_window: Duration::from_secs(10),
        }
    }

    fn wake_event() -> WakeInput {
        WakeInput::Wake(WakeEvent {
            kind: WakeKind::Wake,
            cause: None,
            confidence: Some(0.9),
            energy: None,
        })
    }

    #[test]
    fn wake_opens_session_and_unmutes() {
        let mut core = WakeCore::new(config());
        assert_eq!(core.state(), WakeState::Idle);
        assert!(!core.snapshot().admits_transcripts());

        let now = Instant::now();
        let effects = core.on_input(wake_event(), now);
        assert_eq!(core.state(), WakeState::Listening);
        assert_eq!(effects, vec![WakeEffect::Mic(MicAction::Unmute, Some(30_000))]);
        assert!(core.snapshot().session_id.is_some());
        assert!(core.idle_deadline().is_some());
    }

    #[test]
    fn always_listen_ignores_wake_events() {
        let mut core = WakeCore::new(WakeConfig {
            always_listen: true,
            ..config()
        });
        assert_eq!(core.state(), WakeState::Listening);
        assert!(core.snapshot().admits_transcripts());

        let effects = core.on_input(wake_event(), Instant::now());
        assert!(effects.is_empty());
        assert_eq!(core.state(), WakeState::Listening);
        assert!(core.idle_deadline().is_none());
    }

    #[test]
    fn wake_in_listening_supersedes_session() {
        let mut core = WakeCore::new(config());
        let now = Instant::now();
        core.on_input(wake_event(), now);
        let first = core.snapshot().session_id;

        core.on_input(wake_event(), now + Duration::from_secs(5));
        let second = core.snapshot().session_id;
        assert_ne!(first, second);
        assert_eq!(core.state(), WakeState::Listening);
    }

    #[test]
    fn stream_delta_moves_to_responding() {
        let mut core = WakeCore::new(config());
        let now = Instant::now();
        core.on_input(wake_event(), now);
        core.on_input(
            WakeInput::SetActive {
                correlate: "c1".into(),
            },
            now,
        );
        core.on_input(
            WakeInput::StreamDelta {
                correlate: "c1".into(),
            },
            now,
        );
        assert_eq!(core.state(), WakeState::Responding);
    }

    #[test]
    fn stale_stream_delta_is_ignored() {
        let mut core = WakeCore::new(config());
        let now = Instant::now();
        core.on_input(wake_event(), now);
        core.on_input(
            WakeInput::SetActive {
                correlate: "c2".into(),
            },
            now,
        );
        core.on_input(
            WakeInput::StreamDelta {
                correlate: "c1".into(),
            },
            now,
        );
        assert_eq!(core.state(), WakeState::Listening);
    }

    #[test]
    fn double_wake_within_window_cancels() {
        let mut core = WakeCore::new(config());
        let t0 = Instant::now();
        core.on_input(wake_event(), t0);
        core.on_input(
            WakeInput::SetActive {
                correlate: "c1".into(),
            },
            t0,
        );
        core.on_input(
            WakeInput::StreamDelta {
                correlate: "c1".into(),
            },
            t0 + Duration::from_secs(1),
        );
        assert_eq!(core.state(), WakeState::Responding);

        let effects = core.on_input(wake_event(), t0 + Duration::from_secs(5));
        assert_eq!(
            effects,
            vec![WakeEffect::CancelActive {
                correlate: "c1".into()
            }]
        );
        assert_eq!(core.state(), WakeState::Listening);
        assert!(core.snapshot().active_correlate.is_none());
    }

    #[test]
    fn double_wake_outside_window_keeps_responding() {
        let mut core = WakeCore::new(config());
        let t0 = Instant::now();
        core.on_input(wake_event(), t0);
        core.on_input(
            WakeInput::SetActive {
                correlate: "c1".into(),
            },
            t0,
        );
        core.on_input(
            WakeInput::StreamDelta {
                correlate: "c1".into(),
            },
            t0,
        );

        let effects = core.on_input(wake_event(), t0 + Duration::from_secs(25));
        assert!(effects.is_empty());
        assert_eq!(core.state(), WakeState::Responding);
        assert_eq!(core.snapshot().active_correlate.as_deref(), Some("c1"));
    }

    #[test]
    fn idle_expiry_closes_session() {
        let mut core = WakeCore::new(config());
        let t0 = Instant::now();
        core.on_input(wake_event(), t0);

        let effects = core.on_idle_expired(t0 + Duration::from_secs(31));
        assert_eq!(
            effects,
            vec![
                WakeEffect::AnnounceTimeout,
                WakeEffect::Mic(MicAction::Mute, None),
            ]
        );
        assert_eq!(core.state(), WakeState::Idle);
        assert!(core.snapshot().session_id.is_none());
        assert!(core.idle_deadline().is_none());
    }

    #[test]
    fn idle_expiry_during_response_cancels_active() {
        let mut core = WakeCore::new(config());
        let t0 = Instant::now();
        core.on_input(wake_event(), t0);
        core.on_input(
            WakeInput::SetActive {
                correlate: "c1".into(),
            },
            t0,
        );
        core.on_input(
            WakeInput::StreamDelta {
                correlate: "c1".into(),
            },
            t0,
        );

        let effects = core.on_idle_expired(t0 + Duration::from_secs(31));
        assert_eq!(effects[0], WakeEffect::CancelActive { correlate: "c1".into() });
        assert_eq!(core.state(), WakeState::Idle);
    }

    #[test]
    fn transcript_resets_idle_timer() {
        let mut core = WakeCore::new(config());
        let t0 = Instant::now();
        core.on_input(wake_event(), t0);
        let first_deadline = core.idle_deadline().unwrap();

        core.on_input(WakeInput::Transcript, t0 + Duration::from_secs(10));
        let second_deadline = core.idle_deadline().unwrap();
        assert!(second_deadline > first_deadline);
    }

    #[test]
    fn speaking_end_returns_to_listening() {
        let mut core = WakeCore::new(config());
        let t0 = Instant::now();
        core.on_input(wake_event(), t0);
        core.on_input(
            WakeInput::SetActive {
                correlate: "c1".into(),
            },
            t0,
        );
        core.on_input(
            WakeInput::StreamDelta {
                correlate: "c1".into(),
            },
            t0,
        );
        assert_eq!(core.state(), WakeState::Responding);

        core.on_input(
            WakeInput::TtsStatus(TtsStatusKind::SpeakingEnd),
            t0 + Duration::from_secs(2),
        );
        assert_eq!(core.state(), WakeState::Listening);
        // Still in session.
        assert!(core.snapshot().session_id.is_some());
        assert!(core.snapshot().active_correlate.is_none());
    }

    #[test]
    fn external_timeout_event_closes_session() {
        let mut core = WakeCore::new(config());
        let t0 = Instant::now();
        core.on_input(wake_event(), t0);

        let effects = core.on_input(
            WakeInput::Wake(WakeEvent {
                kind: WakeKind::Timeout,
                cause: Some("silence".into()),
                confidence: None,
                energy: None,
            }),
            t0 + Duration::from_secs(1),
        );
        assert_eq!(effects, vec![WakeEffect::Mic(MicAction::Mute, None)]);
        assert_eq!(core.state(), WakeState::Idle);
    }

    #[test]
    fn stop_cancels_and_closes() {
        let mut core = WakeCore::new(config());
        let t0 = Instant::now();
        core.on_input(wake_event(), t0);
        core.on_input(
            WakeInput::SetActive {
                correlate: "c1".into(),
            },
            t0,
        );

        let effects = core.on_input(WakeInput::Stop, t0);
        assert_eq!(
            effects,
            vec![
                WakeEffect::CancelActive {
                    correlate: "c1".into()
                },
                WakeEffect::Mic(MicAction::Mute, None),
            ]
        );
        assert_eq!(core.state(), WakeState::Idle);
    }

    #[test]
    fn timeout_loopback_in_idle_is_a_noop() {
        let mut core = WakeCore::new(config());
        let effects = core.on_input(
            WakeInput::Wake(WakeEvent {
                kind: WakeKind::Timeout,
                cause: Some("silence".into()),
                confidence: None,
                energy: None,
            }),
            Instant::now(),
        );
        assert!(effects.is_empty());
        assert_eq!(core.state(), WakeState::Idle);
    }
}
