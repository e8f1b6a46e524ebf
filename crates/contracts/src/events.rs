//! Typed event payloads carried in the `data` field of an [`Envelope`].
//!
//! [`EventPayload`] is the discriminated union over the envelope `type`:
//! decoding is a single parse step and downstream code is total. Schemas
//! evolve additively (new optional fields only); a breaking change gets a
//! new type with a `.v2` suffix instead.
//!
//! [`Envelope`]: crate::Envelope

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CodecError;

// ── Speech to text ───────────────────────────────────────────────────

/// Interim transcript while the user is still speaking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SttPartial {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Final transcript for one utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SttFinal {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(default = "default_true")]
    pub is_final: bool,
}

/// Spectrum frame for UI visualisation while audio is being captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SttAudioFft {
    pub fft: Vec<f32>,
}

// ── Wake word ────────────────────────────────────────────────────────

/// What kind of wake event fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeKind {
    Wake,
    Timeout,
}

/// Wake-word detection or session timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WakeEvent {
    #[serde(rename = "type")]
    pub kind: WakeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy: Option<f32>,
}

/// Microphone gating command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MicAction {
    Mute,
    Unmute,
}

/// Mute or unmute the microphone, optionally for a bounded window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WakeMic {
    pub action: MicAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

// ── LLM ──────────────────────────────────────────────────────────────

/// One chat message in an LLM conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Request to the LLM worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
}

/// Complete (non-streamed) LLM response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
}

/// One token delta of a streamed LLM response.
///
/// `seq` is monotonic per correlation; exactly one delta carries
/// `final = true` and terminates the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmStream {
    pub seq: u64,
    pub delta: String,
    #[serde(rename = "final", default)]
    pub is_final: bool,
}

/// Cancel an in-flight LLM request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmCancel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ── TTS ──────────────────────────────────────────────────────────────

/// One utterance for the TTS worker to synthesize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtsSay {
    pub text: String,
    pub utterance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_last: Option<bool>,
}

/// TTS playback lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsStatusKind {
    SpeakingStart,
    SpeakingEnd,
    Error,
}

/// Playback status report from the TTS worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtsStatus {
    pub event: TtsStatusKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utterance_id: Option<String>,
}

/// TTS transport control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsAction {
    Stop,
    Pause,
    Resume,
}

/// Stop, pause or resume TTS playback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtsControl {
    pub action: TtsAction,
}

// ── Memory ───────────────────────────────────────────────────────────

/// Query against the vector memory store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryQuery {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
}

/// One recalled memory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub text: String,
    pub score: f32,
}

/// Result set for a memory query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryResult {
    pub entries: Vec<MemoryEntry>,
}

// ── Character / persona ──────────────────────────────────────────────

/// Request the current character definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterGet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

/// The currently active character, retained on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterCurrent {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub persona: Value,
}

// ── System ───────────────────────────────────────────────────────────

/// Service health heartbeat, retained on `system/health/<service>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

/// Runtime configuration change broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub key: String,
    pub value: Value,
}

// ── Discriminated union ──────────────────────────────────────────────

/// All registered event types, discriminated by the envelope `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    SttPartial(SttPartial),
    SttFinal(SttFinal),
    SttAudioFft(SttAudioFft),
    WakeEvent(WakeEvent),
    WakeMic(WakeMic),
    LlmRequest(LlmRequest),
    LlmResponse(LlmResponse),
    LlmStream(LlmStream),
    LlmCancel(LlmCancel),
    TtsSay(TtsSay),
    TtsStatus(TtsStatus),
    TtsControl(TtsControl),
    MemoryQuery(MemoryQuery),
    MemoryResult(MemoryResult),
    CharacterGet(CharacterGet),
    CharacterCurrent(CharacterCurrent),
    HealthStatus(HealthStatus),
    ConfigUpdate(ConfigUpdate),
}

/// Every registered event type name, in contract order.
pub const REGISTERED_TYPES: &[&str] = &[
    "stt.partial",
    "stt.final",
    "stt.audio_fft",
    "wake.event",
    "wake.mic",
    "llm.request",
    "llm.response",
    "llm.stream",
    "llm.cancel",
    "tts.say",
    "tts.status",
    "tts.control",
    "memory.query",
    "memory.result",
    "character.get",
    "character.current",
    "health.status",
    "config.update",
];

/// Whether `event_type` is in the contract registry.
pub fn is_registered(event_type: &str) -> bool {
    REGISTERED_TYPES.contains(&event_type)
}

impl EventPayload {
    /// The dotted event type name this payload is published under.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SttPartial(_) => "stt.partial",
            Self::SttFinal(_) => "stt.final",
            Self::SttAudioFft(_) => "stt.audio_fft",
            Self::WakeEvent(_) => "wake.event",
            Self::WakeMic(_) => "wake.mic",
            Self::LlmRequest(_) => "llm.request",
            Self::LlmResponse(_) => "llm.response",
            Self::LlmStream(_) => "llm.stream",
            Self::LlmCancel(_) => "llm.cancel",
            Self::TtsSay(_) => "tts.say",
            Self::TtsStatus(_) => "tts.status",
            Self::TtsControl(_) => "tts.control",
            Self::MemoryQuery(_) => "memory.query",
            Self::MemoryResult(_) => "memory.result",
            Self::CharacterGet(_) => "character.get",
            Self::CharacterCurrent(_) => "character.current",
            Self::HealthStatus(_) => "health.status",
            Self::ConfigUpdate(_) => "config.update",
        }
    }

    /// Serialize this payload into an envelope `data` value.
    pub fn to_data(&self) -> Result<Value, CodecError> {
        let value = match self {
            Self::SttPartial(p) => serde_json::to_value(p),
            Self::SttFinal(p) => serde_json::to_value(p),
            Self::SttAudioFft(p) => serde_json::to_value(p),
            Self::WakeEvent(p) => serde_json::to_value(p),
            Self::WakeMic(p) => serde_json::to_value(p),
            Self::LlmRequest(p) => serde_json::to_value(p),
            Self::LlmResponse(p) => serde_json::to_value(p),
            Self::LlmStream(p) => serde_json::to_value(p),
            Self::LlmCancel(p) => serde_json::to_value(p),
            Self::TtsSay(p) => serde_json::to_value(p),
            Self::TtsStatus(p) => serde_json::to_value(p),
            Self::TtsControl(p) => serde_json::to_value(p),
            Self::MemoryQuery(p) => serde_json::to_value(p),
            Self::MemoryResult(p) => serde_json::to_value(p),
            Self::CharacterGet(p) => serde_json::to_value(p),
            Self::CharacterCurrent(p) => serde_json::to_value(p),
            Self::HealthStatus(p) => serde_json::to_value(p),
            Self::ConfigUpdate(p) => serde_json::to_value(p),
        };
        value.map_err(CodecError::Serialize)
    }

    /// Parse an envelope `data` value against the schema for `event_type`.
    ///
    /// Fails with [`CodecError::UnknownEventType`] for unregistered types
    /// and [`CodecError::SchemaViolation`] when the data does not match.
    pub fn from_data(event_type: &str, data: Value) -> Result<Self, CodecError> {
        fn parse<T: serde::de::DeserializeOwned>(
            event_type: &str,
            data: Value,
        ) -> Result<T, CodecError> {
            serde_json::from_value(data).map_err(|e| CodecError::SchemaViolation {
                event_type: event_type.to_string(),
                reason: e.to_string(),
            })
        }

        match event_type {
            "stt.partial" => Ok(Self::SttPartial(parse(event_type, data)?)),
            "stt.final" => Ok(Self::SttFinal(parse(event_type, data)?)),
            "stt.audio_fft" => Ok(Self::SttAudioFft(parse(event_type, data)?)),
            "wake.event" => Ok(Self::WakeEvent(parse(event_type, data)?)),
            "wake.mic" => Ok(Self::WakeMic(parse(event_type, data)?)),
            "llm.request" => Ok(Self::LlmRequest(parse(event_type, data)?)),
            "llm.response" => Ok(Self::LlmResponse(parse(event_type, data)?)),
            "llm.stream" => Ok(Self::LlmStream(parse(event_type, data)?)),
            "llm.cancel" => Ok(Self::LlmCancel(parse(event_type, data)?)),
            "tts.say" => Ok(Self::TtsSay(parse(event_type, data)?)),
            "tts.status" => Ok(Self::TtsStatus(parse(event_type, data)?)),
            "tts.control" => Ok(Self::TtsControl(parse(event_type, data)?)),
            "memory.query" => Ok(Self::MemoryQuery(parse(event_type, data)?)),
            "memory.result" => Ok(Self::MemoryResult(parse(event_type, data)?)),
            "character.get" => Ok(Self::CharacterGet(parse(event_type, data)?)),
            "character.current" => Ok(Self::CharacterCurrent(parse(event_type, data)?)),
            "health.status" => Ok(Self::HealthStatus(parse(event_type, data)?)),
            "config.update" => Ok(Self::ConfigUpdate(parse(event_type, data)?)),
            other => Err(CodecError::UnknownEventType(other.to_string())),
        }
    }
}

fn default_true() -> bool {
    true
}
