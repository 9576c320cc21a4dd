//! Endpoint table and live connections.
//!
//! ## Ownership
//! The registry owns exactly one [`Endpoint`] record and at most one live
//! [`Connection`] per [`Identity`]. Records are created here, mutated only by
//! the registry and the health monitor (through the methods below), and reset
//! in place rather than dropped.
//!
//! ## Ordering
//! `configure` and each reconnect attempt hold the endpoint's lifecycle lock,
//! so connects for one endpoint never overlap. Reads (`status`, `sync_entity`)
//! don't take it; `sync_entity` re-checks readiness right before each use.
//!
//! `shutdown` bumps each slot's epoch. A connect that started before the bump
//! is closed instead of installed, so nothing survives a shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::client::{Connection, Connector};
use super::converter::layer_to_node;
use super::endpoint::{now_ms, Endpoint, EndpointSnapshot, HealthState, Identity};
use crate::error::{BridgeError, Result};
use crate::retry::RetryPolicy;

/// Version reported on the status surface.
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The read-only status surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    #[serde(rename = "ae")]
    pub producer: EndpointSnapshot,
    #[serde(rename = "resolve")]
    pub consumer: EndpointSnapshot,
    pub last_update: u64,
    pub bridge_version: String,
}

impl BridgeStatus {
    pub fn endpoint(&self, identity: Identity) -> &EndpointSnapshot {
        match identity {
            Identity::Producer => &self.producer,
            Identity::Consumer => &self.consumer,
        }
    }
}

struct Slot {
    connector: Arc<dyn Connector>,
    record: Mutex<Endpoint>,
    connection: Mutex<Option<Arc<dyn Connection>>>,
    lifecycle: tokio::sync::Mutex<()>,
    epoch: AtomicU64,
}

impl Slot {
    fn new(identity: Identity, connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            record: Mutex::new(Endpoint::new(identity)),
            connection: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            epoch: AtomicU64::new(0),
        }
    }

    fn record(&self) -> MutexGuard<'_, Endpoint> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connection(&self) -> MutexGuard<'_, Option<Arc<dyn Connection>>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}

async fn close_logged(identity: Identity, conn: &Arc<dyn Connection>, what: &str) {
    if let Err(e) = conn.close().await {
        warn!(identity = %identity, error = %e, "{what} failed");
    }
}

/// Holds both endpoints and their live connections.
pub struct ConnectionRegistry {
    producer: Slot,
    consumer: Slot,
    retry: RetryPolicy,
}

impl ConnectionRegistry {
    pub fn new(
        producer: Arc<dyn Connector>,
        consumer: Arc<dyn Connector>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            producer: Slot::new(Identity::Producer, producer),
            consumer: Slot::new(Identity::Consumer, consumer),
            retry,
        }
    }

    fn slot(&self, identity: Identity) -> &Slot {
        match identity {
            Identity::Producer => &self.producer,
            Identity::Consumer => &self.consumer,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    // -- reads --------------------------------------------------------------

    pub fn snapshot(&self, identity: Identity) -> EndpointSnapshot {
        self.slot(identity).record().snapshot()
    }

    /// Both endpoints plus a freshness timestamp.
    pub fn status(&self) -> BridgeStatus {
        BridgeStatus {
            producer: self.snapshot(Identity::Producer),
            consumer: self.snapshot(Identity::Consumer),
            last_update: now_ms(),
            bridge_version: BRIDGE_VERSION.to_string(),
        }
    }

    pub fn is_connected(&self, identity: Identity) -> bool {
        self.slot(identity).record().is_connected()
    }

    pub fn connection(&self, identity: Identity) -> Option<Arc<dyn Connection>> {
        self.slot(identity).connection().clone()
    }

    // -- state transitions ----------------------------------------------------

    pub fn set_health(&self, identity: Identity, health: HealthState) {
        self.slot(identity).record().set_health(health);
    }

    /// Health becomes `Error` and the message is kept; `connected` is untouched.
    pub fn record_error(&self, identity: Identity, error: &BridgeError) {
        let mut rec = self.slot(identity).record();
        rec.set_health(HealthState::Error);
        rec.record_error(&error.to_string());
    }

    /// `connected = false`, `health = Error`, message recorded.
    pub fn mark_failed(&self, identity: Identity, error: &BridgeError) {
        self.slot(identity).record().mark_failed(&error.to_string());
    }

    pub fn reset(&self, identity: Identity) {
        self.slot(identity).record().reset();
    }

    // -- lifecycle ------------------------------------------------------------

    /// Close and forget the current connection, if any. Never fails.
    pub async fn cleanup(&self, identity: Identity) {
        let stale = self.slot(identity).connection().take();
        if let Some(conn) = stale {
            close_logged(identity, &conn, "cleanup of stale connection").await;
        }
    }

    /// Connect (with retries), probe capabilities, and install the new connection.
    ///
    /// Any existing connection is cleaned up first. On failure the endpoint is
    /// left `connected = false, health = error` and the last error is returned.
    pub async fn configure(&self, identity: Identity) -> Result<EndpointSnapshot> {
        let slot = self.slot(identity);
        let _guard = slot.lifecycle.lock().await;
        let epoch = slot.epoch();

        self.cleanup(identity).await;

        let label = format!("connect {identity}");
        let outcome = match self.retry.execute(&label, || slot.connector.connect()).await {
            Ok(conn) => self.probe_and_install(identity, epoch, conn).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(snapshot) => {
                info!(identity = %identity, version = ?snapshot.version, "endpoint configured");
                Ok(snapshot)
            }
            Err(e) => {
                warn!(identity = %identity, error = %e, "endpoint configuration failed");
                if slot.epoch() == epoch {
                    self.mark_failed(identity, &e);
                }
                Err(e)
            }
        }
    }

    /// One reconnect attempt: best-effort cleanup, a single connect, probe, install.
    ///
    /// Does not touch the record on failure; the caller decides how to report it.
    pub async fn reconnect_once(&self, identity: Identity) -> Result<EndpointSnapshot> {
        let slot = self.slot(identity);
        let _guard = slot.lifecycle.lock().await;
        let epoch = slot.epoch();

        self.cleanup(identity).await;

        let conn = tokio::time::timeout(self.retry.timeout, slot.connector.connect())
            .await
            .map_err(|_| self.timeout_error(format!("connect {identity}")))??;
        self.probe_and_install(identity, epoch, conn).await
    }

    /// Probe `conn` and make it the live connection, unless a shutdown happened
    /// since `epoch` was read.
    async fn probe_and_install(
        &self,
        identity: Identity,
        epoch: u64,
        conn: Arc<dyn Connection>,
    ) -> Result<EndpointSnapshot> {
        let probed = tokio::time::timeout(self.retry.timeout, conn.version())
            .await
            .map_err(|_| self.timeout_error(format!("{identity} version probe")));

        let version = match probed {
            Ok(Ok(v)) => v,
            Ok(Err(e)) | Err(e) => {
                close_logged(identity, &conn, "close after failed probe").await;
                return Err(e);
            }
        };

        let slot = self.slot(identity);
        // Record and connection change under the connection lock; shutdown
        // takes the same lock after bumping the epoch.
        let installed = {
            let mut current = slot.connection();
            if slot.epoch() == epoch {
                let replaced = current.replace(Arc::clone(&conn));
                let mut rec = slot.record();
                rec.mark_connected(version);
                Some((rec.snapshot(), replaced))
            } else {
                None
            }
        };

        match installed {
            Some((snapshot, replaced)) => {
                if let Some(old) = replaced {
                    // Only reachable if someone installed a connection without the lifecycle lock.
                    close_logged(identity, &old, "close of replaced connection").await;
                }
                Ok(snapshot)
            }
            None => {
                info!(identity = %identity, "registry shut down while connecting, discarding connection");
                close_logged(identity, &conn, "close of discarded connection").await;
                Err(BridgeError::connect(
                    slot.connector.target(),
                    "registry shut down while connecting",
                ))
            }
        }
    }

    fn timeout_error(&self, operation: String) -> BridgeError {
        BridgeError::Timeout {
            operation,
            after_ms: self.retry.timeout.as_millis() as u64,
        }
    }

    /// Reset both records, then close both connections.
    ///
    /// The records are reset before any close is awaited, so a caller that
    /// bounds this with a timeout still leaves the registry empty.
    pub async fn shutdown(&self) {
        let mut stale = Vec::new();
        for identity in Identity::ALL {
            let slot = self.slot(identity);
            slot.epoch.fetch_add(1, Ordering::SeqCst);
            let taken = {
                let mut current = slot.connection();
                slot.record().reset();
                current.take()
            };
            if let Some(conn) = taken {
                stale.push((identity, conn));
            }
        }
        for (identity, conn) in stale {
            close_logged(identity, &conn, "shutdown close").await;
        }
    }

    // -- sync -----------------------------------------------------------------

    /// The live connection, if the endpoint is connected and healthy right now.
    fn ready_connection(&self, identity: Identity) -> Result<Arc<dyn Connection>> {
        let snap = self.snapshot(identity);
        if !snap.connected {
            return Err(BridgeError::Precondition(
                "Both bridges must be connected to sync layers".into(),
            ));
        }
        if snap.health != HealthState::Healthy {
            return Err(BridgeError::Precondition(
                "Both bridges must be healthy to sync layers".into(),
            ));
        }
        self.connection(identity).ok_or_else(|| {
            BridgeError::Precondition(format!("{identity} has no live connection"))
        })
    }

    /// Fetch the producer's layers, find `name`, translate it and push it to the consumer.
    ///
    /// # Errors
    /// - [`BridgeError::Precondition`]: either endpoint is not connected and healthy.
    /// - [`BridgeError::NotFound`]: the producer has no layer called `name`.
    /// - whatever the last fetch / create attempt failed with.
    pub async fn sync_entity(&self, name: &str) -> Result<Value> {
        let producer = self.ready_connection(Identity::Producer)?;
        self.ready_connection(Identity::Consumer)?;

        let layers = self
            .retry
            .execute("get layers", || {
                let conn = Arc::clone(&producer);
                async move { conn.fetch_layers().await }
            })
            .await?;

        let layer = layers
            .into_iter()
            .find(|l| l.name == name)
            .ok_or_else(|| BridgeError::NotFound(format!("Layer {name} not found on producer")))?;
        let node = layer_to_node(&layer);

        // Health may have flipped while the layers were in flight.
        let consumer = self.ready_connection(Identity::Consumer)?;
        let created = self
            .retry
            .execute("create node", || {
                let conn = Arc::clone(&consumer);
                let node = node.clone();
                async move { conn.create_node(&node).await }
            })
            .await?;

        for identity in Identity::ALL {
            self.slot(identity).record().touch_sync();
        }
        info!(layer = name, node_type = %node.node_type, "layer synced");
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct NullConn;

    #[async_trait]
    impl Connection for NullConn {
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
        async fn version(&self) -> Result<Option<String>> {
            Ok(Some("1.0".into()))
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct FlakyConnector {
        fail_first: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        fn target(&self) -> String {
            "flaky".into()
        }
        async fn connect(&self) -> Result<Arc<dyn Connection>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                Err(BridgeError::connect("flaky", format!("refused #{n}")))
            } else {
                Ok(Arc::new(NullConn))
            }
        }
    }

    fn registry(fail_first: u32) -> ConnectionRegistry {
        let fast = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(200));
        ConnectionRegistry::new(
            Arc::new(FlakyConnector { fail_first, calls: AtomicU32::new(0) }),
            Arc::new(FlakyConnector { fail_first: 0, calls: AtomicU32::new(0) }),
            fast,
        )
    }

    #[tokio::test]
    async fn test_configure_success_marks_healthy() {
        let reg = registry(2);
        let snap = reg.configure(Identity::Producer).await.unwrap();
        assert!(snap.connected && snap.configured);
        assert_eq!(snap.health, HealthState::Healthy);
        assert_eq!(snap.version.as_deref(), Some("1.0"));
        assert!(reg.connection(Identity::Producer).is_some());
    }

    #[tokio::test]
    async fn test_configure_exhausted_marks_error_with_last_message() {
        let reg = registry(10);
        let err = reg.configure(Identity::Producer).await.unwrap_err();
        assert!(err.to_string().contains("refused #3"), "{err}");
        let snap = reg.snapshot(Identity::Producer);
        assert!(!snap.connected);
        assert_eq!(snap.health, HealthState::Error);
        assert!(snap.last_error.unwrap().contains("refused #3"));
        assert!(reg.connection(Identity::Producer).is_none());
    }

    #[tokio::test]
    async fn test_status_has_both_endpoints_and_version() {
        let reg = registry(0);
        reg.configure(Identity::Consumer).await.unwrap();
        let status = reg.status();
        assert!(status.consumer.connected);
        assert!(!status.producer.connected);
        assert_eq!(status.bridge_version, BRIDGE_VERSION);
        let v = serde_json::to_value(&status).unwrap();
        assert!(v.get("ae").is_some());
        assert!(v.get("resolve").is_some());
        assert!(v.get("lastUpdate").is_some());
    }

    #[tokio::test]
    async fn test_sync_requires_both_connected() {
        let reg = registry(0);
        reg.configure(Identity::Producer).await.unwrap();
        let err = reg.sync_entity("BG").await.unwrap_err();
        assert_eq!(err.kind(), "precondition");
    }

    struct SlowConnector {
        delay: Duration,
        closes: Arc<AtomicU32>,
    }

    struct CountingConn {
        closes: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Connection for CountingConn {
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
        async fn version(&self) -> Result<Option<String>> {
            Ok(None)
        }
        async fn close(&self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Err(BridgeError::Protocol("already closed".into()))
        }
    }

    #[async_trait]
    impl Connector for SlowConnector {
        fn target(&self) -> String {
            "slow".into()
        }
        async fn connect(&self) -> Result<Arc<dyn Connection>> {
            tokio::time::sleep(self.delay).await;
            Ok(Arc::new(CountingConn { closes: Arc::clone(&self.closes) }))
        }
    }

    #[tokio::test]
    async fn test_connect_in_flight_during_shutdown_is_discarded() {
        let closes = Arc::new(AtomicU32::new(0));
        let reg = Arc::new(ConnectionRegistry::new(
            Arc::new(SlowConnector { delay: Duration::from_millis(100), closes: Arc::clone(&closes) }),
            Arc::new(FlakyConnector { fail_first: 0, calls: AtomicU32::new(0) }),
            RetryPolicy::new(1, Duration::from_millis(1), Duration::from_secs(1)),
        ));

        let pending = {
            let reg = Arc::clone(&reg);
            tokio::spawn(async move { reg.reconnect_once(Identity::Producer).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        reg.shutdown().await;

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), "connect");
        assert!(reg.connection(Identity::Producer).is_none());
        assert_eq!(reg.snapshot(Identity::Producer), Endpoint::new(Identity::Producer).snapshot());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_configure_after_shutdown_installs_again() {
        let reg = registry(0);
        reg.shutdown().await;
        assert!(reg.configure(Identity::Producer).await.unwrap().connected);
        assert!(reg.connection(Identity::Producer).is_some());
    }

    #[tokio::test]
    async fn test_shutdown_resets_records() {
        let reg = registry(0);
        reg.configure(Identity::Producer).await.unwrap();
        reg.shutdown().await;
        assert!(reg.connection(Identity::Producer).is_none());
        assert_eq!(reg.snapshot(Identity::Producer).health, HealthState::Unknown);
    }
}
