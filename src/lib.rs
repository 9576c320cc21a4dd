//! # conectify-bridge
//!
//! Keeps After Effects (the producer) and DaVinci Resolve (the consumer)
//! bridged: a WebSocket relay between their host-side helpers, a supervised
//! connection to each application with health checks and reconnection, and
//! the layer-to-node translation used to sync content across.
//!
//! - [`bridge`]: connection registry, health monitor, translation, orchestrator façade.
//! - [`relay`]: relay hub, envelope classification, producer commands, relay client.
//! - [`retry`]: the bounded retry primitive and client-side linear backoff.
//! - [`config`]: TOML configuration.

pub mod bridge;
pub mod cli;
pub mod config;
pub mod error;
pub mod relay;
pub mod retry;

pub use bridge::{BridgeOrchestrator, BridgeStatus, Identity, OperationOutcome};
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use retry::{LinearBackoff, RetryPolicy};
