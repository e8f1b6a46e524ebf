use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in the router core.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("codec error: {0}")]
    Codec(#[from] tars_contracts::CodecError),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("publish failed on '{topic}': {reason}")]
    PublishFailed { topic: String, reason: String },

    #[error("subscribe failed for '{pattern}': {reason}")]
    SubscribeFailed { pattern: String, reason: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("rules file error: {0}")]
    Rules(String),

    #[error("handler timed out after {0:?}")]
    HandlerTimeout(Duration),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl RouterError {
    /// Process exit code for this error when it aborts startup.
    ///
    /// 1 = configuration error, 2 = unrecoverable broker error,
    /// 3 = internal invariant violation.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Rules(_) => 1,
            Self::BrokerUnavailable(_)
            | Self::SubscribeFailed { .. }
            | Self::PublishFailed { .. } => 2,
            Self::Invariant(_) => 3,
            _ => 1,
        }
    }
}
