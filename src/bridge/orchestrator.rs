//! The façade the UI layer and the CLI talk to.
//!
//! Owns the registry, the health monitor and, while running, the relay hub and
//! both background tasks. Data operations never return `Err`: they report an
//! [`OperationOutcome`] so callers always get a value. Lifecycle operations
//! (`start`, `stop`) do return errors; a [`BridgeError::Bind`] from `start` is
//! the one fatal condition.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::client::{ConsumerConnector, Connector, ProducerConnector};
use super::endpoint::Identity;
use super::health::{HealthMonitor, ReconnectStrategy};
use super::registry::{BridgeStatus, ConnectionRegistry};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::relay::hub::RelayHub;
use crate::relay::scripts::{HostCommands, ScriptRunner};

/// Structured result of a data operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcome {
    pub success: bool,
    pub message: String,
    /// [`BridgeError::kind`] of the failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl OperationOutcome {
    pub fn ok(message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error_kind: None,
            data,
        }
    }

    pub fn failed(error: &BridgeError) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            error_kind: Some(error.kind().to_string()),
            data: None,
        }
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    relay_addr: SocketAddr,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

pub struct BridgeOrchestrator {
    config: BridgeConfig,
    registry: Arc<ConnectionRegistry>,
    monitor: Arc<HealthMonitor>,
    commands: Option<Arc<dyn HostCommands>>,
    running: Mutex<Option<Running>>,
}

impl BridgeOrchestrator {
    /// Build with the real transports from `config`, plus a script runner when
    /// `[scripts]` is present.
    pub fn new(config: BridgeConfig) -> Self {
        let producer = Arc::new(ProducerConnector::new(config.producer.url.clone()));
        let consumer = Arc::new(
            ConsumerConnector::new(config.consumer.url.clone())
                .request_timeout(config.retry_policy().timeout),
        );
        let scripts = config.scripts.clone();
        let orchestrator = Self::with_connectors(config, producer, consumer);
        match scripts {
            Some(scripts) => orchestrator.with_host_commands(Arc::new(ScriptRunner::new(scripts))),
            None => orchestrator,
        }
    }

    pub fn with_connectors(
        config: BridgeConfig,
        producer: Arc<dyn Connector>,
        consumer: Arc<dyn Connector>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(producer, consumer, config.retry_policy()));
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            Arc::new(config.reconnect_strategy()),
            config.health_config(),
        ));
        Self {
            config,
            registry,
            monitor,
            commands: None,
            running: Mutex::new(None),
        }
    }

    /// Replace the default reconnection sequence.
    pub fn with_reconnect_strategy(mut self, strategy: Arc<dyn ReconnectStrategy>) -> Self {
        self.monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&self.registry),
            strategy,
            self.config.health_config(),
        ));
        self
    }

    /// Handler for producer commands arriving on the relay.
    pub fn with_host_commands(mut self, commands: Arc<dyn HostCommands>) -> Self {
        self.commands = Some(commands);
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    // -- data operations ------------------------------------------------------

    pub async fn configure(&self, identity: Identity) -> OperationOutcome {
        match self.registry.configure(identity).await {
            Ok(snapshot) => OperationOutcome::ok(
                format!("{identity} bridge configured"),
                serde_json::to_value(snapshot).ok(),
            ),
            Err(e) => OperationOutcome::failed(&e),
        }
    }

    /// Configure both endpoints concurrently.
    pub async fn configure_all(&self) -> [(Identity, OperationOutcome); 2] {
        let (producer, consumer) = tokio::join!(
            self.configure(Identity::Producer),
            self.configure(Identity::Consumer)
        );
        [(Identity::Producer, producer), (Identity::Consumer, consumer)]
    }

    pub fn get_status(&self) -> BridgeStatus {
        self.registry.status()
    }

    pub async fn sync_entity(&self, name: &str) -> OperationOutcome {
        match self.registry.sync_entity(name).await {
            Ok(created) => OperationOutcome::ok(format!("Layer {name} synced"), Some(created)),
            Err(e) => {
                warn!(layer = name, error = %e, "sync failed");
                OperationOutcome::failed(&e)
            }
        }
    }

    // -- lifecycle ------------------------------------------------------------

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn relay_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.relay_addr)
    }

    /// Bind the relay and start the relay and health-check tasks.
    ///
    /// # Errors
    /// - [`BridgeError::AlreadyRunning`] if started twice.
    /// - [`BridgeError::Bind`] if the relay port stays unavailable (fatal).
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(BridgeError::AlreadyRunning);
        }

        let mut hub = RelayHub::bind(&self.config.relay_addr(), self.config.bind_policy()).await?;
        if let Some(commands) = &self.commands {
            hub = hub.with_commands(Arc::clone(commands));
        }
        let hub = Arc::new(hub);
        let relay_addr = hub.local_addr();

        let (shutdown, rx) = watch::channel(false);
        let tasks = vec![
            ("relay", tokio::spawn(Arc::clone(&hub).run(rx.clone()))),
            ("health", tokio::spawn(Arc::clone(&self.monitor).run(rx))),
        ];

        *running = Some(Running {
            shutdown,
            relay_addr,
            tasks,
        });
        info!(relay = %relay_addr, "bridge started");
        Ok(relay_addr)
    }

    /// Signal shutdown, wait up to the grace period, then abort what is left
    /// and close both endpoint connections.
    pub async fn stop(&self) -> Result<()> {
        let running = self.running.lock().await.take().ok_or(BridgeError::NotRunning)?;
        let grace = self.config.shutdown_grace();
        info!(grace_ms = grace.as_millis() as u64, "stopping bridge");

        running.shutdown.send_replace(true);
        let deadline = tokio::time::Instant::now() + grace;
        for (name, mut task) in running.tasks {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => debug!(task = name, "task stopped"),
                Ok(Err(e)) => warn!(task = name, error = %e, "task failed during shutdown"),
                Err(_) => {
                    warn!(task = name, "task did not stop within grace period, aborting");
                    task.abort();
                    // Dropping the task's future also aborts the health checks it owns.
                    let _ = task.await;
                }
            }
        }

        // Records are reset before any close is awaited; only the closes are bounded.
        if tokio::time::timeout(grace, self.registry.shutdown()).await.is_err() {
            warn!("closing endpoint connections exceeded grace period");
        }
        info!("bridge stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_failed_carries_kind() {
        let out = OperationOutcome::failed(&BridgeError::NotFound("Layer X not found on producer".into()));
        assert!(!out.success);
        assert_eq!(out.message, "Layer X not found on producer");
        assert_eq!(out.error_kind.as_deref(), Some("not_found"));
    }

    #[test]
    fn test_outcome_json_shape() {
        let v = serde_json::to_value(OperationOutcome::ok("done", None)).unwrap();
        assert_eq!(v, serde_json::json!({"success": true, "message": "done"}));
    }
}
