//! MQTT broker client.
//!
//! One logical connection shared by every publisher. The event-loop task
//! owns reconnection: on broker drop it retries with bounded exponential
//! backoff and silently re-establishes every recorded subscription on
//! the next session (our retained last-will marks us unhealthy in the
//! meantime). Only configuration/auth refusals are terminal.
//!
//! Publishes outstanding at a disconnect are reported failed to the
//! caller and never retried inside the client; redelivery is the
//! caller's choice.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, LastWill, MqttOptions,
    Packet, QoS,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{MqttConfig, MqttEndpoint};
use crate::dispatch::IncomingMessage;
use crate::error::RouterError;
use crate::metrics::{names, Metrics};
use crate::traits::Publish;

/// Retained last-will published by the broker on our behalf if the
/// connection dies.
#[derive(Debug, Clone)]
pub struct LastWillConfig {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Connection settings for [`connect`].
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub endpoint: MqttEndpoint,
    pub client_id: String,
    pub keepalive: Duration,
    pub last_will: Option<LastWillConfig>,
    /// Capacity of the incoming-message channel; the event loop applies
    /// backpressure to the broker reader when the dispatcher lags.
    pub incoming_capacity: usize,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

impl MqttSettings {
    pub fn from_config(
        config: &MqttConfig,
        last_will: Option<LastWillConfig>,
    ) -> Result<Self, RouterError> {
        Ok(Self {
            endpoint: config.endpoint()?,
            client_id: config.client_id.clone(),
            keepalive: config.keepalive,
            last_will,
            incoming_capacity: 256,
            reconnect_min: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
        })
    }
}

type SubscriptionList = Arc<Mutex<Vec<(String, QoS)>>>;

/// Shared handle to the single logical broker connection.
pub struct BrokerClient {
    client: AsyncClient,
    subscriptions: SubscriptionList,
    event_task: JoinHandle<()>,
}

/// Connect and resolve once the MQTT session is ready.
///
/// Transient failures keep the retry loop going; the returned future
/// resolves with an error only for terminal (configuration/auth)
/// refusals or when the event loop dies before the first session.
pub async fn connect(
    settings: MqttSettings,
    metrics: Metrics,
) -> Result<(Arc<BrokerClient>, mpsc::Receiver<IncomingMessage>), RouterError> {
    let mut options = MqttOptions::new(
        settings.client_id.clone(),
        settings.endpoint.host.clone(),
        settings.endpoint.port,
    );
    options.set_keep_alive(settings.keepalive);
    if let Some(username) = &settings.endpoint.username {
        options.set_credentials(
            username.clone(),
            settings.endpoint.password.clone().unwrap_or_default(),
        );
    }
    if let Some(will) = &settings.last_will {
        options.set_last_will(LastWill::new(
            &will.topic,
            will.payload.clone(),
            QoS::AtLeastOnce,
            will.retain,
        ));
    }

    let (client, eventloop) = AsyncClient::new(options, 64);
    let (incoming_tx, incoming_rx) = mpsc::channel(settings.incoming_capacity);
    let (ready_tx, ready_rx) = oneshot::channel();
    let subscriptions: SubscriptionList = Arc::new(Mutex::new(Vec::new()));

    let event_task = tokio::spawn(run_event_loop(
        eventloop,
        client.clone(),
        subscriptions.clone(),
        incoming_tx,
        ready_tx,
        metrics,
        settings.reconnect_min,
        settings.reconnect_max,
    ));

    info!(
        host = %settings.endpoint.host,
        port = settings.endpoint.port,
        client_id = %settings.client_id,
        "connecting to mqtt broker"
    );

    match ready_rx.await {
        Ok(Ok(())) => Ok((
            Arc::new(BrokerClient {
                client,
                subscriptions,
                event_task,
            }),
            incoming_rx,
        )),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(RouterError::BrokerUnavailable(
            "event loop terminated before the session was ready".into(),
        )),
    }
}

impl BrokerClient {
    /// Publish raw bytes. Safe to call concurrently; returns
    /// [`RouterError::PublishFailed`] when the request cannot be handed
    /// to the connection.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), RouterError> {
        self.client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(|e| RouterError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    /// Subscribe and record the pattern for re-subscription after a
    /// reconnect.
    pub async fn subscribe(&self, pattern: &str, qos: QoS) -> Result<(), RouterError> {
        lock(&self.subscriptions).push((pattern.to_string(), qos));
        self.client
            .subscribe(pattern, qos)
            .await
            .map_err(|e| RouterError::SubscribeFailed {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })
    }

    /// Disconnect and stop the event loop. Idempotent.
    pub async fn close(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "disconnect while already closed");
        }
        self.event_task.abort();
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: SubscriptionList,
    incoming_tx: mpsc::Sender<IncomingMessage>,
    ready_tx: oneshot::Sender<Result<(), RouterError>>,
    metrics: Metrics,
    reconnect_min: Duration,
    reconnect_max: Duration,
) {
    let mut ready = Some(ready_tx);
    let mut backoff = reconnect_min;
    let mut connected_at: Option<Instant> = None;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    // rumqttc surfaces refusals as errors too; belt and
                    // braces for broker quirks.
                    warn!(code = ?ack.code, "connection refused by broker");
                    continue;
                }
                backoff = reconnect_min;
                match ready.take() {
                    Some(ready) => {
                        info!("mqtt session established");
                        let _ = ready.send(Ok(()));
                    }
                    None => {
                        info!("mqtt session re-established");
                        if let Some(prev) = connected_at {
                            metrics.observe(
                                names::BROKER_RECONNECTS,
                                "",
                                prev.elapsed().as_secs_f64() * 1000.0,
                            );
                        }
                        resubscribe(&client, &subscriptions);
                    }
                }
                connected_at = Some(Instant::now());
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = IncomingMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                    retain: publish.retain,
                };
                if incoming_tx.send(message).await.is_err() {
                    debug!("incoming receiver dropped, stopping event loop");
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                if is_terminal(&e) {
                    error!(error = %e, "terminal mqtt error");
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(RouterError::BrokerUnavailable(e.to_string())));
                    }
                    break;
                }
                warn!(error = %e, backoff = ?backoff, "mqtt connection error, retrying");
                tokio::time::sleep(backoff).await;
                backoff = next_backoff(backoff, reconnect_max);
            }
        }
    }
}

fn resubscribe(client: &AsyncClient, subscriptions: &Mutex<Vec<(String, QoS)>>) {
    let subscriptions = lock(subscriptions).clone();
    for (pattern, qos) in subscriptions {
        debug!(pattern = %pattern, "re-subscribing after reconnect");
        // try_subscribe: awaiting inside the poll task could deadlock on
        // a full request queue.
        if let Err(e) = client.try_subscribe(&pattern, qos) {
            warn!(pattern = %pattern, error = %e, "re-subscribe failed");
        }
    }
}

/// Whether a connection error is a configuration/auth refusal that
/// retrying cannot fix.
fn is_terminal(error: &ConnectionError) -> bool {
    match error {
        ConnectionError::ConnectionRefused(code) => matches!(
            code,
            ConnectReturnCode::BadUserNamePassword
                | ConnectReturnCode::NotAuthorized
                | ConnectReturnCode::BadClientId
                | ConnectReturnCode::RefusedProtocolVersion
        ),
        _ => false,
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ── Publisher ────────────────────────────────────────────────────────

/// [`Publish`] implementation over the shared broker client, with
/// per-topic publish metrics.
pub struct MqttPublisher {
    client: Arc<BrokerClient>,
    metrics: Metrics,
}

impl MqttPublisher {
    pub fn new(client: Arc<BrokerClient>, metrics: Metrics) -> Self {
        Self { client, metrics }
    }
}

#[async_trait]
impl Publish for MqttPublisher {
    async fn publish_raw(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), RouterError> {
        match self.client.publish(topic, payload, qos, retain).await {
            Ok(()) => {
                self.metrics
                    .incr(names::PUBLISHES, &format!("{topic},ok"));
                Ok(())
            }
            Err(e) => {
                self.metrics
                    .incr(names::PUBLISHES, &format!("{topic},error"));
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let max = Duration::from_secs(30);
        let mut backoff = Duration::from_millis(500);
        let mut seen = Vec::new();
        for _ in 0..8 {
            backoff = next_backoff(backoff, max);
            seen.push(backoff);
        }
        assert_eq!(seen[0], Duration::from_secs(1));
        assert_eq!(seen[1], Duration::from_secs(2));
        assert!(seen.iter().all(|b| *b <= max));
        assert_eq!(*seen.last().unwrap(), max);
    }

    #[test]
    fn auth_refusals_are_terminal() {
        assert!(is_terminal(&ConnectionError::ConnectionRefused(
            ConnectReturnCode::NotAuthorized
        )));
        assert!(is_terminal(&ConnectionError::ConnectionRefused(
            ConnectReturnCode::BadUserNamePassword
        )));
        assert!(!is_terminal(&ConnectionError::ConnectionRefused(
            ConnectReturnCode::ServiceUnavailable
        )));
        assert!(!is_terminal(&ConnectionError::NetworkTimeout));
    }

    #[test]
    fn settings_from_config() {
        let config = MqttConfig {
            url: "mqtt://user:pw@broker:1884".into(),
            client_id: "router-test".into(),
            keepalive: Duration::from_secs(10),
        };
        let settings = MqttSettings::from_config(&config, None).unwrap();
        assert_eq!(settings.endpoint.host, "broker");
        assert_eq!(settings.endpoint.port, 1884);
        assert_eq!(settings.endpoint.username.as_deref(), Some("user"));
        assert_eq!(settings.client_id, "router-test");
    }

    #[test]
    fn settings_reject_bad_url() {
        let config = MqttConfig {
            url: "not a url".into(),
            client_id: "x".into(),
            keepalive: Duration::from_secs(10),
        };
        assert!(MqttSettings::from_config(&config, None).is_err());
    }
}
