//! Topic constants and MQTT wildcard matching.
//!
//! Topics are forward-slash segmented. Retained topics carry last-value
//! semantics. `+` matches one level, `#` matches any remaining levels and
//! must be the last segment of a pattern.

// ── Subscribed by the router ─────────────────────────────────────────

pub const STT_FINAL: &str = "stt/final";
pub const STT_PARTIAL: &str = "stt/partial";
pub const WAKE_EVENT: &str = "wake/event";
pub const LLM_RESPONSE: &str = "llm/response";
pub const LLM_STREAM: &str = "llm/stream";
pub const LLM_CANCEL: &str = "llm/cancel";
pub const TTS_STATUS: &str = "tts/status";

/// Retained health records for every peer service.
pub const SYSTEM_HEALTH_WILDCARD: &str = "system/health/+";

/// Retained currently-active character.
pub const CHARACTER_CURRENT: &str = "system/character/current";

// ── Published by the router ──────────────────────────────────────────

pub const LLM_REQUEST: &str = "llm/request";
pub const TTS_SAY: &str = "tts/say";
pub const TTS_CONTROL: &str = "tts/control";
pub const WAKE_MIC: &str = "wake/mic";

/// The retained health topic for a given service name.
pub fn health_topic(service: &str) -> String {
    format!("system/health/{service}")
}

/// Extract the service name from a `system/health/<service>` topic.
pub fn service_from_health_topic(topic: &str) -> Option<&str> {
    topic.strip_prefix("system/health/").filter(|s| !s.is_empty() && !s.contains('/'))
}

// ── Wildcard matching ────────────────────────────────────────────────

/// Match an incoming topic against a subscription pattern.
///
/// Matching is verified client-side against incoming topics to cover
/// broker wildcard quirks: `+` matches exactly one level, `#` matches any
/// number of remaining levels including zero.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_segs = pattern.split('/');
    let mut topic_segs = topic.split('/');

    loop {
        match (pattern_segs.next(), topic_segs.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
