//! The universal wire envelope.
//!
//! Every message on the bus is a JSON object with a stable outer shape;
//! the `data` field carries one of the typed records in
//! [`events`](crate::events).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::CodecError;
use crate::events::{self, EventPayload};

/// Wire-format envelope for every bus message.
///
/// `id` is a random 128-bit value, unique per logical emission; retries
/// reuse the same `id` so receivers can deduplicate. `correlate` links a
/// request to its response and stream chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Random 128-bit hex id, unique per logical emission.
    pub id: String,

    /// Dotted event type name (e.g. `stt.final`).
    #[serde(rename = "type")]
    pub event_type: String,

    /// Unix seconds at creation, fractional.
    pub ts: f64,

    /// Name of the producing service.
    pub source: String,

    /// Optional id linking request → response → stream chunks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlate: Option<String>,

    /// Event-specific payload, validated against the type's schema.
    pub data: Value,
}

impl Envelope {
    /// Create an envelope with a fresh id and timestamp.
    pub fn new(
        source: impl Into<String>,
        payload: &EventPayload,
        correlate: Option<String>,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            id: fresh_id(),
            event_type: payload.kind().to_string(),
            ts: now_ts(),
            source: source.into(),
            correlate,
            data: payload.to_data()?,
        })
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(CodecError::Serialize)
    }

    /// Deserialize wire bytes, checking the outer envelope shape only.
    ///
    /// Fails with [`CodecError::MalformedEnvelope`] when required fields
    /// are missing or have the wrong types.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::MalformedEnvelope(e.to_string()))
    }

    /// Deserialize wire bytes and validate `data` against the registered
    /// schema for `type`, in one step.
    pub fn decode_typed(bytes: &[u8]) -> Result<(Self, EventPayload), CodecError> {
        let envelope = Self::decode(bytes)?;
        let payload = envelope.payload()?;
        Ok((envelope, payload))
    }

    /// Parse `data` against the schema registered for this envelope's type.
    pub fn payload(&self) -> Result<EventPayload, CodecError> {
        if !events::is_registered(&self.event_type) {
            return Err(CodecError::UnknownEventType(self.event_type.clone()));
        }
        EventPayload::from_data(&self.event_type, self.data.clone())
    }
}

/// A fresh unpredictable 128-bit id as 32 hex characters.
pub fn fresh_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Current unix time as fractional seconds.
pub fn now_ts() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{LlmCancel, SttFinal};
    use serde_json::json;

    fn sample() -> Envelope {
        Envelope::new(
            "stt",
            &EventPayload::SttFinal(SttFinal {
                text: "what time is it".into(),
                confidence: Some(0.93),
                lang: None,
                is_final: true,
            }),
            None,
        )
        .unwrap()
    }

    #[test]
    fn roundtrip() {
        let env = sample();
        let bytes = env.encode().unwrap();
        let (decoded, payload) = Envelope::decode_typed(&bytes).unwrap();

        assert_eq!(decoded.id, env.id);
        assert_eq!(decoded.event_type, "stt.final");
        assert_eq!(decoded.source, "stt");
        match payload {
            EventPayload::SttFinal(p) => assert_eq!(p.text, "what time is it"),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn ids_are_128_bit_hex_and_unique() {
        let a = sample();
        let b = sample();
        assert_eq!(a.id.len(), 32);
        assert!(a.id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn correlate_is_preserved() {
        let env = Envelope::new(
            "router",
            &EventPayload::LlmCancel(LlmCancel { reason: None }),
            Some("c1".into()),
        )
        .unwrap();
        let bytes = env.encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded.correlate.as_deref(), Some("c1"));
    }

    #[test]
    fn decode_rejects_missing_fields() {
        let bytes = serde_json::to_vec(&json!({"id": "abc", "type": "stt.final"})).unwrap();
        let err = Envelope::decode(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::MalformedEnvelope(_)));
    }

    #[test]
    fn decode_rejects_wrong_field_types() {
        let bytes = serde_json::to_vec(&json!({
            "id": "abc",
            "type": "stt.final",
            "ts": "not-a-number",
            "source": "stt",
            "data": {}
        }))
        .unwrap();
        let err = Envelope::decode(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::MalformedEnvelope(_)));
    }

    #[test]
    fn decode_typed_rejects_unknown_type() {
        let bytes = serde_json::to_vec(&json!({
            "id": "abc",
            "type": "stt.final.v9",
            "ts": 1.0,
            "source": "stt",
            "data": {}
        }))
        .unwrap();
        let err = Envelope::decode_typed(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::UnknownEventType(_)));
    }

    #[test]
    fn decode_typed_rejects_bad_schema() {
        let bytes = serde_json::to_vec(&json!({
            "id": "abc",
            "type": "stt.final",
            "ts": 1.0,
            "source": "stt",
            "data": {"confidence": "high"}
        }))
        .unwrap();
        let err = Envelope::decode_typed(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::SchemaViolation { .. }));
    }

    #[test]
    fn not_json_at_all() {
        let err = Envelope::decode(b"\x00\x01\x02").unwrap_err();
        assert!(matches!(err, CodecError::MalformedEnvelope(_)));
    }
}
