//! Test support: a recording publisher shared by the unit tests and the
//! integration suite.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::QoS;
use tars_contracts::{events::TtsSay, Envelope, EventPayload};

use crate::error::RouterError;
use crate::traits::Publish;

/// A message captured by [`RecordingPublisher`].
#[derive(Debug, Clone)]
pub struct Recorded {
    pub topic: String,
    pub envelope: Envelope,
    pub qos: QoS,
    pub retain: bool,
}

impl Recorded {
    /// Decode the typed payload of the captured envelope.
    pub fn payload(&self) -> EventPayload {
        self.envelope
            .payload()
            .expect("recorded envelope should carry a registered payload")
    }
}

/// In-memory [`Publish`] implementation that records everything.
#[derive(Default)]
pub struct RecordingPublisher {
    records: Mutex<Vec<Recorded>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records captured so far.
    pub fn records(&self) -> Vec<Recorded> {
        self.records.lock().expect("records lock").clone()
    }

    /// Records published on a given topic.
    pub fn on_topic(&self, topic: &str) -> Vec<Recorded> {
        self.records()
            .into_iter()
            .filter(|r| r.topic == topic)
            .collect()
    }

    /// All `tts.say` payloads, in publish order.
    pub fn says(&self) -> Vec<TtsSay> {
        self.records()
            .into_iter()
            .filter_map(|r| match r.payload() {
                EventPayload::TtsSay(say) => Some(say),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self) -> usize {
        self.records.lock().expect("records lock").len()
    }

    /// Poll until `topic` has at least `n` records or `timeout` elapses.
    /// Returns the records on that topic either way.
    pub async fn wait_for(&self, topic: &str, n: usize, timeout: Duration) -> Vec<Recorded> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let records = self.on_topic(topic);
            if records.len() >= n || tokio::time::Instant::now() >= deadline {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Publish for RecordingPublisher {
    async fn publish_raw(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), RouterError> {
        let envelope =
            Envelope::decode(&payload).map_err(|e| RouterError::PublishFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        self.records.lock().expect("records lock").push(Recorded {
            topic: topic.to_string(),
            envelope,
            qos,
            retain,
        });
        Ok(())
    }
}
