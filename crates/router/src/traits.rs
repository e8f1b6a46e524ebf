use std::sync::Arc;

use async_trait::async_trait;
use rumqttc::QoS;
use tars_contracts::{Envelope, EventPayload};

use crate::error::RouterError;

/// Publishes messages onto the bus.
///
/// Every component that emits messages goes through this seam so it can
/// be exercised against a recording publisher in tests. The real
/// implementation is [`MqttPublisher`](crate::mqtt::MqttPublisher).
#[async_trait]
pub trait Publish: Send + Sync {
    /// Publish raw bytes to a topic. Safe to call concurrently.
    async fn publish_raw(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), RouterError>;

    /// Build an [`Envelope`] (fresh id and timestamp) around `payload`
    /// and publish it. Returns the envelope so callers can track the id.
    async fn publish_event(
        &self,
        source: &str,
        topic: &str,
        payload: &EventPayload,
        correlate: Option<String>,
        qos: QoS,
        retain: bool,
    ) -> Result<Envelope, RouterError> {
        let envelope = Envelope::new(source, payload, correlate)?;
        self.publish_raw(topic, envelope.encode()?, qos, retain)
            .await?;
        Ok(envelope)
    }
}

/// Blanket implementation so `Arc<dyn Publish>` can be used directly.
#[async_trait]
impl<T: Publish + ?Sized> Publish for Arc<T> {
    async fn publish_raw(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), RouterError> {
        (**self).publish_raw(topic, payload, qos, retain).await
    }
}
