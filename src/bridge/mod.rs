//! # Bridge
//!
//! Keeps the producer (compositing app) and the consumer (node-graph app)
//! connected, healthy and in sync.
//!
//! ## What It Does
//!
//! 1. **Connection lifecycle**: [`ConnectionRegistry`] connects each endpoint
//!    under a [`RetryPolicy`](crate::retry::RetryPolicy), probes its version and
//!    keeps at most one live [`Connection`] per endpoint.
//! 2. **Health**: [`HealthMonitor`] pings every connected endpoint on an
//!    interval and hands failures to an injected [`ReconnectStrategy`].
//! 3. **Sync**: `sync_entity` pulls a layer from the producer, translates it
//!    with [`layer_to_node`] and creates the node on the consumer.
//! 4. **Façade**: [`BridgeOrchestrator`] composes the above with the relay hub
//!    and owns every background task.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let bridge = BridgeOrchestrator::new(BridgeConfig::default());
//! bridge.start().await?;
//! let outcome = bridge.configure(Identity::Producer).await;
//! let status = bridge.get_status();
//! bridge.stop().await?;
//! ```

pub mod client;
pub mod converter;
pub mod endpoint;
pub mod health;
pub mod orchestrator;
pub mod registry;

pub use client::{Connection, Connector, ConsumerConnector, ProducerConnector};
pub use converter::{layer_to_node, layer_to_node_report, LayerDescriptor, LayerType, NodeDescriptor, NodeProperty, TypeTag};
pub use endpoint::{EndpointSnapshot, HealthState, Identity};
pub use health::{HealthConfig, HealthMonitor, ReconnectStrategy, SequentialReconnect};
pub use orchestrator::{BridgeOrchestrator, OperationOutcome};
pub use registry::{BridgeStatus, ConnectionRegistry, BRIDGE_VERSION};
