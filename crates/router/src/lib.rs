//! TARS Router Core — the central orchestrator of the TARS voice bus.
//!
//! Routes user transcripts through the LLM worker and streams responses
//! to TTS with sentence-boundary flushing and bounded-queue backpressure,
//! gates ingestion behind a wake-word state machine, tracks peer-service
//! health from retained topics, and exposes a typed publish/subscribe
//! dispatcher with per-message deduplication.

pub mod boundary;
pub mod character;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod metrics;
pub mod mqtt;
pub mod policy;
pub mod stream;
pub mod supervisor;
pub mod testing;
pub mod traits;
pub mod wake;

pub use config::{OverflowPolicy, RouterConfig};
pub use dispatch::{Ctx, Dispatcher, Handler, IncomingMessage};
pub use error::RouterError;
pub use health::HealthRegistry;
pub use metrics::Metrics;
pub use policy::{Decision, PolicyEngine, RouteAction, RuleSet};
pub use stream::StreamAssembler;
pub use supervisor::Supervisor;
pub use traits::Publish;
pub use wake::{WakeHandle, WakeMachine, WakeSnapshot, WakeState};

/// Source name this service stamps on every envelope it emits.
pub const SERVICE_NAME: &str = "router";
