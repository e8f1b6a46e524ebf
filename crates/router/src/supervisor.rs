//! Component wiring and process lifecycle.
//!
//! Startup: config → metrics → broker (with retained unhealthy last
//! will) → retained `starting` health → subscriptions → handlers →
//! dispatch loop → retained `ready` health. Shutdown on SIGINT/SIGTERM:
//! stop intake, drain handlers, drop active streams, retained `shutdown`
//! health, close the broker.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::QoS;
use tars_contracts::events::{
    ChatMessage, EventPayload, HealthStatus, LlmRequest, TtsSay,
};
use tars_contracts::{envelope, topics, Envelope};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::character::CharacterStore;
use crate::config::RouterConfig;
use crate::dispatch::{Ctx, Dispatcher, Handler};
use crate::error::RouterError;
use crate::health::HealthRegistry;
use crate::metrics::{self, names, Metrics};
use crate::mqtt::{self, LastWillConfig, MqttPublisher, MqttSettings};
use crate::policy::{PolicyEngine, RouteAction, RuleSet};
use crate::stream::StreamAssembler;
use crate::traits::Publish;
use crate::wake::{WakeHandle, WakeInput, WakeMachine};
use crate::SERVICE_NAME;

/// How long the dispatcher may drain in-flight handlers at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Core topic subscriptions with their QoS levels.
const SUBSCRIPTIONS: &[(&str, QoS)] = &[
    (topics::STT_FINAL, QoS::AtLeastOnce),
    (topics::STT_PARTIAL, QoS::AtMostOnce),
    (topics::WAKE_EVENT, QoS::AtLeastOnce),
    (topics::LLM_RESPONSE, QoS::AtLeastOnce),
    (topics::LLM_STREAM, QoS::AtLeastOnce),
    (topics::LLM_CANCEL, QoS::AtLeastOnce),
    (topics::TTS_STATUS, QoS::AtLeastOnce),
    (topics::SYSTEM_HEALTH_WILDCARD, QoS::AtLeastOnce),
    (topics::CHARACTER_CURRENT, QoS::AtLeastOnce),
];

/// Everything the core handlers need, shared behind one `Arc`.
pub struct RouterDeps {
    pub publisher: Arc<dyn Publish>,
    pub metrics: Metrics,
    pub policy: Arc<PolicyEngine>,
    pub health: HealthRegistry,
    pub wake: WakeHandle,
    pub assembler: Arc<StreamAssembler>,
    pub character: CharacterStore,
    pub stream_enabled: bool,
}

/// Owns the lifecycle of the router process.
pub struct Supervisor;

impl Supervisor {
    /// Run the router until a shutdown signal arrives.
    pub async fn run(config: RouterConfig) -> Result<(), RouterError> {
        config.validate()?;

        let metrics = Metrics::new();
        let rules = RuleSet::load(config.rules_file.as_deref())?;
        let policy = Arc::new(PolicyEngine::new(rules));
        let health = HealthRegistry::new(config.health.stale_after, metrics.clone());
        let character = CharacterStore::new();

        // The broker holds our unhealthy state as a retained last will;
        // it fires if the connection dies without a clean shutdown.
        let will_envelope = Envelope::new(
            SERVICE_NAME,
            &EventPayload::HealthStatus(HealthStatus {
                ok: false,
                event: Some("lost".into()),
                err: None,
            }),
            None,
        )?;
        let last_will = LastWillConfig {
            topic: topics::health_topic(SERVICE_NAME),
            payload: will_envelope.encode()?,
            retain: true,
        };

        let settings = MqttSettings::from_config(&config.mqtt, Some(last_will))?;
        let (client, incoming) = mqtt::connect(settings, metrics.clone()).await?;
        let publisher: Arc<dyn Publish> =
            Arc::new(MqttPublisher::new(client.clone(), metrics.clone()));

        publish_health(&publisher, true, "starting").await?;

        for (pattern, qos) in SUBSCRIPTIONS {
            client.subscribe(pattern, *qos).await?;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let assembler = Arc::new(StreamAssembler::new(
            config.stream.clone(),
            config.handler_timeout,
            publisher.clone(),
            metrics.clone(),
        ));
        let (machine, wake) = WakeMachine::new(
            config.wake.clone(),
            publisher.clone(),
            assembler.clone(),
            metrics.clone(),
            shutdown_rx.clone(),
        );
        let machine_task = tokio::spawn(machine.run());
        let sweeper_task = tokio::spawn(health.clone().run_sweeper(shutdown_rx.clone()));
        let _metrics_task = config
            .metrics_port
            .map(|port| metrics::spawn_metrics_server(port, metrics.clone(), shutdown_rx.clone()));

        let deps = Arc::new(RouterDeps {
            publisher: publisher.clone(),
            metrics: metrics.clone(),
            policy,
            health,
            wake,
            assembler: assembler.clone(),
            character,
            stream_enabled: config.stream.enabled,
        });

        let mut dispatcher = Dispatcher::new(
            publisher.clone(),
            metrics.clone(),
            &config.dedup,
            config.handler_timeout,
            SHUTDOWN_GRACE,
            shutdown_rx,
        );
        register_core_handlers(&mut dispatcher, &deps);
        let dispatch_task = tokio::spawn(dispatcher.run(incoming));

        publish_health(&publisher, true, "ready").await?;
        info!(client_id = %config.mqtt.client_id, "router ready");

        wait_for_signal().await;
        info!("shutdown signal received");

        // Stop intake, then let the dispatcher drain within its grace.
        let _ = shutdown_tx.send(true);
        if tokio::time::timeout(SHUTDOWN_GRACE + Duration::from_secs(1), dispatch_task)
            .await
            .is_err()
        {
            warn!("dispatcher did not stop within grace, continuing shutdown");
        }

        assembler.cancel_all();
        let _ = tokio::time::timeout(Duration::from_secs(1), machine_task).await;
        let _ = tokio::time::timeout(Duration::from_secs(1), sweeper_task).await;

        if let Err(e) = publish_health(&publisher, false, "shutdown").await {
            warn!(error = %e, "failed to publish shutdown health");
        }
        client.close().await;

        info!("router stopped");
        Ok(())
    }
}

/// Publish this service's retained health record.
async fn publish_health(
    publisher: &Arc<dyn Publish>,
    ok: bool,
    event: &str,
) -> Result<(), RouterError> {
    publisher
        .publish_event(
            SERVICE_NAME,
            &topics::health_topic(SERVICE_NAME),
            &EventPayload::HealthStatus(HealthStatus {
                ok,
                event: Some(event.to_string()),
                err: None,
            }),
            None,
            QoS::AtLeastOnce,
            true,
        )
        .await?;
    Ok(())
}

/// Wait for SIGINT or SIGTERM (Unix) or Ctrl+C (cross-platform fallback).
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl_c");
    }
}

// ── Handler registration ─────────────────────────────────────────────

/// Register the core handlers on a dispatcher. Public so the integration
/// suite can wire the same routing over in-memory channels.
pub fn register_core_handlers(dispatcher: &mut Dispatcher, deps: &Arc<RouterDeps>) {
    dispatcher.register(topics::STT_FINAL, "transcript", transcript_handler(deps.clone()));
    dispatcher.register(
        topics::STT_PARTIAL,
        "transcript-activity",
        partial_handler(deps.clone()),
    );
    dispatcher.register(topics::WAKE_EVENT, "wake-event", wake_event_handler(deps.clone()));
    dispatcher.register(topics::LLM_STREAM, "llm-stream", llm_stream_handler(deps.clone()));
    dispatcher.register(
        topics::LLM_RESPONSE,
        "llm-response",
        llm_response_handler(deps.clone()),
    );
    dispatcher.register(topics::LLM_CANCEL, "llm-cancel", llm_cancel_handler(deps.clone()));
    dispatcher.register(topics::TTS_STATUS, "tts-status", tts_status_handler(deps.clone()));
    dispatcher.register_exempt(
        topics::SYSTEM_HEALTH_WILDCARD,
        "health-registry",
        health_handler(deps.clone()),
    );
    dispatcher.register_exempt(
        topics::CHARACTER_CURRENT,
        "character-store",
        character_handler(deps.clone()),
    );
}

/// `stt/final` → policy → drop / direct TTS / cancel / forward to LLM.
fn transcript_handler(deps: Arc<RouterDeps>) -> Handler {
    Arc::new(move |ctx, env| {
        let deps = deps.clone();
        Box::pin(async move {
            let EventPayload::SttFinal(stt) = env.payload()? else {
                return Ok(());
            };
            deps.wake.send(WakeInput::Transcript).await;

            let snapshot = deps.wake.snapshot();
            let llm_healthy = deps.health.assume_ok("llm");
            let decision = deps.policy.decide(&stt.text, &snapshot, llm_healthy);
            debug!(
                correlate = %env.correlate.clone().unwrap_or_default(),
                reason = decision.reason,
                "transcript decision"
            );

            match decision.action {
                RouteAction::Drop => {
                    deps.metrics.incr(names::TRANSCRIPTS_DROPPED, decision.reason);
                    if decision.reason == "llm_down" {
                        warn!(text = %stt.text, "dropping transcript, llm is down with no fallback");
                    }
                }
                RouteAction::DirectTts { text } => {
                    say(&ctx, &text, env.correlate.clone()).await?;
                }
                RouteAction::CancelLlm { ack } => {
                    deps.wake.send(WakeInput::Stop).await;
                    if let Some(ack) = ack {
                        say(&ctx, &ack, env.correlate.clone()).await?;
                    }
                }
                RouteAction::ForwardLlm => {
                    if !deps.health.assume_ok("tts") {
                        warn!("tts reports unhealthy, forwarding to llm anyway");
                    }
                    let correlate = envelope::fresh_id();
                    deps.wake
                        .send(WakeInput::SetActive {
                            correlate: correlate.clone(),
                        })
                        .await;

                    let request = LlmRequest {
                        messages: vec![ChatMessage {
                            role: "user".into(),
                            content: stt.text.clone(),
                        }],
                        system: deps.character.system_prompt(),
                        stream: Some(deps.stream_enabled),
                        tools: None,
                    };
                    ctx.publisher
                        .publish_event(
                            SERVICE_NAME,
                            topics::LLM_REQUEST,
                            &EventPayload::LlmRequest(request),
                            Some(correlate),
                            QoS::AtLeastOnce,
                            false,
                        )
                        .await?;
                }
            }
            Ok(())
        })
    })
}

/// `stt/partial` → idle-timer activity only; partials are never routed.
fn partial_handler(deps: Arc<RouterDeps>) -> Handler {
    Arc::new(move |_ctx, env| {
        let deps = deps.clone();
        Box::pin(async move {
            if let EventPayload::SttPartial(_) = env.payload()? {
                deps.wake.send(WakeInput::Transcript).await;
            }
            Ok(())
        })
    })
}

/// `wake/event` → wake machine input.
fn wake_event_handler(deps: Arc<RouterDeps>) -> Handler {
    Arc::new(move |_ctx, env| {
        let deps = deps.clone();
        Box::pin(async move {
            if let EventPayload::WakeEvent(event) = env.payload()? {
                deps.wake.send(WakeInput::Wake(event)).await;
            }
            Ok(())
        })
    })
}

/// `llm/stream` → stream assembler, with stale-correlation rejection.
fn llm_stream_handler(deps: Arc<RouterDeps>) -> Handler {
    Arc::new(move |_ctx, env| {
        let deps = deps.clone();
        Box::pin(async move {
            let EventPayload::LlmStream(delta) = env.payload()? else {
                return Ok(());
            };
            if !deps.stream_enabled {
                debug!("ignoring llm.stream, streaming is disabled");
                return Ok(());
            }
            let Some(correlate) = env.correlate.clone() else {
                debug!("llm.stream without correlate ignored");
                return Ok(());
            };

            let snapshot = deps.wake.snapshot();
            if let Some(active) = &snapshot.active_correlate {
                if *active != correlate {
                    debug!(
                        correlate = %correlate,
                        active = %active,
                        "stale stream chunk rejected"
                    );
                    return Ok(());
                }
            }

            deps.wake
                .send(WakeInput::StreamDelta {
                    correlate: correlate.clone(),
                })
                .await;
            deps.assembler.handle_delta(&correlate, delta).await;
            Ok(())
        })
    })
}

/// `llm/response` → full-response TTS when streaming is disabled.
fn llm_response_handler(deps: Arc<RouterDeps>) -> Handler {
    Arc::new(move |ctx, env| {
        let deps = deps.clone();
        Box::pin(async move {
            let EventPayload::LlmResponse(response) = env.payload()? else {
                return Ok(());
            };
            if deps.stream_enabled {
                // The worker streams for us; the full response is only a
                // convenience copy.
                debug!(correlate = %env.correlate.clone().unwrap_or_default(),
                    "ignoring llm.response in streaming mode");
                return Ok(());
            }
            say(&ctx, &response.text, env.correlate.clone()).await
        })
    })
}

/// `llm/cancel` → clear the stream buffer (also catches our own
/// loop-back cancel publishes; the assembler makes this idempotent).
fn llm_cancel_handler(deps: Arc<RouterDeps>) -> Handler {
    Arc::new(move |_ctx, env| {
        let deps = deps.clone();
        Box::pin(async move {
            if let EventPayload::LlmCancel(_) = env.payload()? {
                if let Some(correlate) = env.correlate.as_deref() {
                    deps.assembler.cancel(correlate).await;
                }
            }
            Ok(())
        })
    })
}

/// `tts/status` → wake machine input.
fn tts_status_handler(deps: Arc<RouterDeps>) -> Handler {
    Arc::new(move |_ctx, env| {
        let deps = deps.clone();
        Box::pin(async move {
            if let EventPayload::TtsStatus(status) = env.payload()? {
                deps.wake.send(WakeInput::TtsStatus(status.event)).await;
            }
            Ok(())
        })
    })
}

/// `system/health/+` → health registry (dedup-exempt).
fn health_handler(deps: Arc<RouterDeps>) -> Handler {
    Arc::new(move |ctx, env| {
        let deps = deps.clone();
        Box::pin(async move {
            let Some(service) = topics::service_from_health_topic(&ctx.topic) else {
                debug!(topic = %ctx.topic, "health message on unexpected topic");
                return Ok(());
            };
            if let EventPayload::HealthStatus(status) = env.payload()? {
                deps.health.observe(service, &status, env.ts);
            }
            Ok(())
        })
    })
}

/// `system/character/current` → character store (dedup-exempt).
fn character_handler(deps: Arc<RouterDeps>) -> Handler {
    Arc::new(move |_ctx, env| {
        let deps = deps.clone();
        Box::pin(async move {
            if let EventPayload::CharacterCurrent(character) = env.payload()? {
                deps.character.set(character);
            }
            Ok(())
        })
    })
}

/// Publish one complete TTS utterance.
async fn say(ctx: &Ctx, text: &str, correlate: Option<String>) -> Result<(), RouterError> {
    ctx.publisher
        .publish_event(
            SERVICE_NAME,
            topics::TTS_SAY,
            &EventPayload::TtsSay(TtsSay {
                text: text.to_string(),
                utterance_id: envelope::fresh_id(),
                voice: None,
                is_last: Some(true),
            }),
            correlate,
            QoS::AtLeastOnce,
            false,
        )
        .await?;
    Ok(())
}
