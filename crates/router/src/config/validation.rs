use super::types::RouterConfig;
use crate::error::RouterError;

impl RouterConfig {
    /// Validate the config: range checks and endpoint parseability.
    pub fn validate(&self) -> Result<(), RouterError> {
        self.validate_mqtt()?;
        self.validate_stream()?;
        self.validate_timers()?;
        self.validate_bounds()?;
        Ok(())
    }

    fn validate_mqtt(&self) -> Result<(), RouterError> {
        self.mqtt.endpoint()?;
        if self.mqtt.client_id.is_empty() {
            return Err(RouterError::Config("CLIENT_ID must not be empty".into()));
        }
        Ok(())
    }

    fn validate_stream(&self) -> Result<(), RouterError> {
        if self.stream.min_chars == 0 {
            return Err(RouterError::Config("STREAM_MIN must be at least 1".into()));
        }
        if self.stream.min_chars > self.stream.max_chars {
            return Err(RouterError::Config(format!(
                "STREAM_MIN ({}) must not exceed STREAM_MAX ({})",
                self.stream.min_chars, self.stream.max_chars
            )));
        }
        if self.stream.queue_max == 0 {
            return Err(RouterError::Config(
                "STREAM_QUEUE_MAX must be at least 1".into(),
            ));
        }
        Ok(())
    }

    fn validate_timers(&self) -> Result<(), RouterError> {
        if self.handler_timeout.is_zero() {
            return Err(RouterError::Config(
                "HANDLER_TIMEOUT_SEC must be greater than zero".into(),
            ));
        }
        if self.wake.idle_timeout.is_zero() {
            return Err(RouterError::Config(
                "WAKE_IDLE_TIMEOUT_SEC must be greater than zero".into(),
            ));
        }
        if self.dedup.ttl.is_zero() {
            return Err(RouterError::Config(
                "DEDUP_TTL_SEC must be greater than zero".into(),
            ));
        }
        if self.health.stale_after.is_zero() {
            return Err(RouterError::Config(
                "HEALTH_STALE_SEC must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    fn validate_bounds(&self) -> Result<(), RouterError> {
        if self.dedup.max_entries == 0 {
            return Err(RouterError::Config("DEDUP_MAX must be at least 1".into()));
        }
        Ok(())
    }
}
