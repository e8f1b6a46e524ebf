//! Routing policy for final transcripts.
//!
//! The engine is pure: no I/O, no side effects. It computes a
//! [`Decision`] from the transcript, the wake-session snapshot, and the
//! LLM health bit; the transcript handler executes it.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::RouterError;
use crate::wake::WakeSnapshot;

// ── Rule set ─────────────────────────────────────────────────────────

/// One phrase → canned reply pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CannedReply {
    pub phrase: String,
    pub reply: String,
}

/// Data-driven rule set consulted before the LLM.
///
/// Loaded from `RULES_FILE` (TOML) when configured; built-in defaults
/// otherwise. Phrases are compared against normalized transcripts
/// (lowercased, punctuation stripped, whitespace collapsed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSet {
    /// Transcripts that cancel the in-flight response and close the session.
    #[serde(default)]
    pub stop_phrases: Vec<String>,

    /// Transcripts that are just the wake word; answered with `ack_reply`.
    #[serde(default)]
    pub wake_acks: Vec<String>,

    /// Reply spoken for a wake acknowledgment.
    #[serde(default)]
    pub ack_reply: Option<String>,

    /// Additional fixed question → answer pairs.
    #[serde(default)]
    pub canned: Vec<CannedReply>,

    /// Spoken when the LLM service is unhealthy. Absent means transcripts
    /// are dropped while the LLM is down.
    #[serde(default)]
    pub offline_fallback: Option<String>,

    /// Transcripts shorter than this (in chars, after normalization) are
    /// ignored as noise.
    #[serde(default = "default_min_length")]
    pub min_length_chars: usize,
}

fn default_min_length() -> usize {
    2
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            stop_phrases: [
                "stop",
                "cancel",
                "never mind",
                "nevermind",
                "be quiet",
                "that's enough",
            ]
            .map(String::from)
            .to_vec(),
            wake_acks: ["tars", "hey tars", "hello tars"].map(String::from).to_vec(),
            ack_reply: Some("Yes?".into()),
            canned: Vec::new(),
            offline_fallback: Some("I'm offline, please retry in a moment.".into()),
            min_length_chars: default_min_length(),
        }
    }
}

impl RuleSet {
    /// Load a rule set from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, RouterError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RouterError::Rules(format!("{}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| RouterError::Rules(format!("{}: {e}", path.display())))
    }

    /// Load from `path` when set, defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, RouterError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}

// ── Decisions ────────────────────────────────────────────────────────

/// What to do with a transcript.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteAction {
    /// Ignore the transcript.
    Drop,
    /// Speak a canned reply without involving the LLM.
    DirectTts { text: String },
    /// Forward to the LLM worker.
    ForwardLlm,
    /// Cancel the in-flight response; optionally acknowledge out loud.
    CancelLlm { ack: Option<String> },
}

/// A routing decision plus the rule that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action: RouteAction,
    pub reason: &'static str,
}

// ── Engine ───────────────────────────────────────────────────────────

/// Pure decision engine over the rule set.
pub struct PolicyEngine {
    rules: RuleSet,
}

impl PolicyEngine {
    pub fn new(rules: RuleSet) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Decide what to do with a final transcript.
    ///
    /// Priority order, first match wins: closed session, too-short
    /// transcript, stop phrase, wake acknowledgment, canned reply, LLM
    /// down (fallback or drop), forward. TTS health never gates here;
    /// the handler logs a warning and forwards anyway.
    pub fn decide(&self, transcript: &str, wake: &WakeSnapshot, llm_healthy: bool) -> Decision {
        if !wake.admits_transcripts() {
            return Decision {
                action: RouteAction::Drop,
                reason: "session_closed",
            };
        }

        let normalized = normalize(transcript);
        if normalized.chars().count() < self.rules.min_length_chars {
            return Decision {
                action: RouteAction::Drop,
                reason: "too_short",
            };
        }

        if self.matches_any(&normalized, &self.rules.stop_phrases) {
            return Decision {
                action: RouteAction::CancelLlm {
                    ack: None,
                },
                reason: "stop_phrase",
            };
        }

        if self.matches_any(&normalized, &self.rules.wake_acks) {
            if let Some(reply) = &self.rules.ack_reply {
                return Decision {
                    action: RouteAction::DirectTts {
                        text: reply.clone(),
                    },
                    reason: "wake_ack",
                };
            }
            return Decision {
                action: RouteAction::Drop,
                reason: "wake_ack",
            };
        }

        if let Some(rule) = self
            .rules
            .canned
            .iter()
            .find(|rule| normalize(&rule.phrase) == normalized)
        {
            return Decision {
                action: RouteAction::DirectTts {
                    text: rule.reply.clone(),
                },
                reason: "canned_reply",
            };
        }

        if !llm_healthy {
            return match &self.rules.offline_fallback {
                Some(text) => Decision {
                    action: RouteAction::DirectTts { text: text.clone() },
                    reason: "llm_down_fallback",
                },
                None => Decision {
                    action: RouteAction::Drop,
                    reason: "llm_down",
                },
            };
        }

        Decision {
            action: RouteAction::ForwardLlm,
            reason: "forward",
        }
    }

    fn matches_any(&self, normalized: &str, phrases: &[String]) -> bool {
        phrases.iter().any(|p| normalize(p) == normalized)
    }
}

/// Lowercase, strip punctuation, collapse whitespace.
fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = true;
    for ch in text.chars() {
        if ch.is_alphanumeric() || ch == '\'' {
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}
