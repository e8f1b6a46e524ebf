use thiserror::Error;

/// Errors produced while encoding or decoding bus envelopes.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The bytes are not a JSON object with the required envelope fields.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The envelope's `type` is not in the contract registry.
    #[error("unknown event type '{0}'")]
    UnknownEventType(String),

    /// The `data` field does not match the schema registered for `type`.
    #[error("schema violation for '{event_type}': {reason}")]
    SchemaViolation { event_type: String, reason: String },

    /// The envelope could not be serialized (should not happen for
    /// well-formed payloads; surfaced rather than panicking).
    #[error("envelope serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}
