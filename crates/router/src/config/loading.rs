use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use super::types::RouterConfig;

impl RouterConfig {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// Unset variables fall back to defaults; unparsable values are
    /// logged and fall back to defaults as well. Range checks happen in
    /// [`RouterConfig::validate`](super::types::RouterConfig), not here.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let mut config = defaults.clone();

        if let Some(v) = lookup("MQTT_URL") {
            config.mqtt.url = v;
        }
        if let Some(v) = lookup("CLIENT_ID") {
            config.mqtt.client_id = v;
        }
        config.mqtt.keepalive = parse_secs(&lookup, "MQTT_KEEPALIVE_SEC", defaults.mqtt.keepalive);

        if let Some(v) = lookup("LOG_LEVEL") {
            config.log_level = v;
        }
        config.metrics_port = lookup("METRICS_PORT").and_then(|v| match v.parse::<u16>() {
            Ok(0) => None,
            Ok(port) => Some(port),
            Err(_) => {
                warn!(value = %v, "ignoring unparsable METRICS_PORT");
                None
            }
        });
        config.handler_timeout =
            parse_secs(&lookup, "HANDLER_TIMEOUT_SEC", defaults.handler_timeout);

        config.stream.enabled = parse_bool(&lookup, "STREAM_ENABLED", defaults.stream.enabled);
        config.stream.min_chars = parse_or(&lookup, "STREAM_MIN", defaults.stream.min_chars);
        config.stream.max_chars = parse_or(&lookup, "STREAM_MAX", defaults.stream.max_chars);
        config.stream.flush_on_boundary =
            parse_bool(&lookup, "STREAM_BOUNDARY", defaults.stream.flush_on_boundary);
        config.stream.queue_max = parse_or(&lookup, "STREAM_QUEUE_MAX", defaults.stream.queue_max);
        config.stream.overflow = parse_or(&lookup, "STREAM_OVERFLOW", defaults.stream.overflow);
        config.stream.reorder_window =
            parse_or(&lookup, "STREAM_REORDER_WINDOW", defaults.stream.reorder_window);

        config.wake.always_listen =
            parse_bool(&lookup, "WAKE_ALWAYS_LISTEN", defaults.wake.always_listen);
        config.wake.idle_timeout =
            parse_secs(&lookup, "WAKE_IDLE_TIMEOUT_SEC", defaults.wake.idle_timeout);
        config.wake.interrupt_window = parse_secs(
            &lookup,
            "WAKE_INTERRUPT_WINDOW_SEC",
            defaults.wake.interrupt_window,
        );

        config.dedup.ttl = parse_secs(&lookup, "DEDUP_TTL_SEC", defaults.dedup.ttl);
        config.dedup.max_entries = parse_or(&lookup, "DEDUP_MAX", defaults.dedup.max_entries);

        config.health.stale_after =
            parse_secs(&lookup, "HEALTH_STALE_SEC", defaults.health.stale_after);

        config.rules_file = lookup("RULES_FILE").map(PathBuf::from);

        config
    }
}

// ── Parse helpers ───────────────────────────────────────────────────

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "ignoring unparsable value, using default");
                default
            }
        },
        None => default,
    }
}

fn parse_bool<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                warn!(key, value = %raw, "ignoring unparsable boolean, using default");
                default
            }
        },
        None => default,
    }
}

/// Parse a duration given in (possibly fractional) seconds.
fn parse_secs<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.parse::<f64>() {
            Ok(secs) if secs.is_finite() && secs >= 0.0 => Duration::from_secs_f64(secs),
            _ => {
                warn!(key, value = %raw, "ignoring unparsable duration, using default");
                default
            }
        },
        None => default,
    }
}
