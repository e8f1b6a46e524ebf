use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::RouterError;

// ── Top-level config ────────────────────────────────────────────────

/// Full configuration for the router core.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Broker connection settings.
    pub mqtt: MqttConfig,

    /// Log verbosity (`LOG_LEVEL`), an `EnvFilter` directive.
    pub log_level: String,

    /// Optional HTTP port for the `/metrics` JSON endpoint.
    pub metrics_port: Option<u16>,

    /// Per-handler execution limit (`HANDLER_TIMEOUT_SEC`).
    pub handler_timeout: Duration,

    /// Stream assembler settings.
    pub stream: StreamConfig,

    /// Wake-state machine settings.
    pub wake: WakeConfig,

    /// Dedup cache settings.
    pub dedup: DedupConfig,

    /// Health registry settings.
    pub health: HealthConfig,

    /// Optional TOML file overriding the built-in policy rule set.
    pub rules_file: Option<PathBuf>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig::default(),
            log_level: "info".into(),
            metrics_port: None,
            handler_timeout: Duration::from_secs(30),
            stream: StreamConfig::default(),
            wake: WakeConfig::default(),
            dedup: DedupConfig::default(),
            health: HealthConfig::default(),
            rules_file: None,
        }
    }
}

// ── Section configs ─────────────────────────────────────────────────

/// Broker connection settings.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Broker endpoint, `mqtt://[user:pass@]host[:port]`.
    pub url: String,

    /// Stable MQTT client identifier.
    pub client_id: String,

    /// Keepalive interval.
    pub keepalive: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            url: "mqtt://127.0.0.1:1883".into(),
            client_id: "tars-router".into(),
            keepalive: Duration::from_secs(30),
        }
    }
}

/// Resolved broker endpoint parsed out of `MqttConfig::url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl MqttConfig {
    /// Parse the configured URL into host/port/credentials.
    pub fn endpoint(&self) -> Result<MqttEndpoint, RouterError> {
        let url = url::Url::parse(&self.url)
            .map_err(|e| RouterError::Config(format!("invalid MQTT_URL '{}': {e}", self.url)))?;

        match url.scheme() {
            "mqtt" | "tcp" => {}
            other => {
                return Err(RouterError::Config(format!(
                    "unsupported MQTT_URL scheme '{other}', expected 'mqtt'"
                )))
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| RouterError::Config("MQTT_URL is missing a host".into()))?
            .to_string();
        let port = url.port().unwrap_or(1883);

        let username = Some(url.username())
            .filter(|u| !u.is_empty())
            .map(|u| u.to_string());
        let password = url.password().map(|p| p.to_string());

        Ok(MqttEndpoint {
            host,
            port,
            username,
            password,
        })
    }
}

/// Stream assembler settings.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// When off, only full `llm.response` messages are forwarded to TTS.
    pub enabled: bool,

    /// Minimum chunk length (chars) before a boundary flush.
    pub min_chars: usize,

    /// Maximum accumulator length (chars) before a forced flush.
    pub max_chars: usize,

    /// Flush on sentence boundaries only (vs. any time min is reached).
    pub flush_on_boundary: bool,

    /// Bounded TTS chunk queue capacity per correlation.
    pub queue_max: usize,

    /// What to do when the chunk queue is full.
    pub overflow: OverflowPolicy,

    /// How many out-of-order deltas to hold before declaring a gap.
    pub reorder_window: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_chars: 10,
            max_chars: 500,
            flush_on_boundary: true,
            queue_max: 16,
            overflow: OverflowPolicy::Drop,
            reorder_window: 8,
        }
    }
}

/// Overflow policy for the bounded TTS chunk queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop the incoming chunk, count it, log a warning.
    Drop,
    /// Suspend the producer until space frees, bounded by the handler
    /// timeout; on timeout, drop and log.
    Block,
}

impl FromStr for OverflowPolicy {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "block" => Ok(Self::Block),
            other => Err(RouterError::Config(format!(
                "invalid STREAM_OVERFLOW '{other}', expected 'drop' or 'block'"
            ))),
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drop => write!(f, "drop"),
            Self::Block => write!(f, "block"),
        }
    }
}

/// Wake-state machine settings.
#[derive(Debug, Clone)]
pub struct WakeConfig {
    /// Disable wake gating entirely; the machine stays in `Listening`.
    pub always_listen: bool,

    /// Idle window before an open session returns to `Idle`.
    pub idle_timeout: Duration,

    /// Window in which a second wake cancels the current response.
    pub interrupt_window: Duration,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            always_listen: false,
            idle_timeout: Duration::from_secs(30),
            interrupt_window: Duration::from_secs(10),
        }
    }
}

/// Dedup cache settings.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Entry lifetime.
    pub ttl: Duration,

    /// Cache capacity.
    pub max_entries: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            max_entries: 4096,
        }
    }
}

/// Health registry settings.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Grace period before a silent service is considered stale.
    pub stale_after: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(30),
        }
    }
}
