//! Periodic liveness probing and reconnection.
//!
//! ```text
//!   tick ──► connected? ──no──► skip
//!               │yes
//!               ▼
//!        ping (RetryPolicy) ──ok──► HEALTHY
//!               │failed
//!               ▼
//!           UNHEALTHY ──► ReconnectStrategy ──ok──► HEALTHY
//!                                 │failed
//!                                 ▼
//!                       ERROR (connected = false)
//! ```
//!
//! The monitor never lets an error or panic escape a tick. Each endpoint is
//! checked in its own task so one slow or failing side never delays the other.
//! Those tasks live in a [`JoinSet`] owned by the tick: dropping the tick, or a
//! shutdown signal arriving mid-tick, aborts them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::endpoint::{EndpointSnapshot, HealthState, Identity};
use super::registry::ConnectionRegistry;
use crate::error::{BridgeError, Result};
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// ReconnectStrategy
// ---------------------------------------------------------------------------

/// What the monitor does after an endpoint fails its probe.
#[async_trait]
pub trait ReconnectStrategy: Send + Sync {
    /// Try to bring `identity` back. On `Err` the monitor marks the endpoint failed.
    async fn reconnect(
        &self,
        registry: &ConnectionRegistry,
        identity: Identity,
    ) -> Result<EndpointSnapshot>;
}

/// Up to `max_attempts` single-shot reconnects, `retry_delay` apart (fixed, not exponential).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequentialReconnect {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for SequentialReconnect {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(2000),
        }
    }
}

#[async_trait]
impl ReconnectStrategy for SequentialReconnect {
    async fn reconnect(
        &self,
        registry: &ConnectionRegistry,
        identity: Identity,
    ) -> Result<EndpointSnapshot> {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            info!(identity = %identity, attempt, max_attempts = attempts, "reconnect attempt");
            match registry.reconnect_once(identity).await {
                Ok(snapshot) => {
                    info!(identity = %identity, attempt, "reconnected");
                    return Ok(snapshot);
                }
                Err(e) => {
                    warn!(identity = %identity, attempt, error = %e, "reconnect attempt failed");
                    if attempt >= attempts {
                        error!(identity = %identity, attempts, "giving up on reconnect");
                        return Err(e);
                    }
                }
            }
            tokio::time::sleep(self.retry_delay).await;
            attempt += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// HealthMonitor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    /// Time between ticks.
    pub interval: Duration,
    /// Policy each liveness probe runs under.
    pub probe: RetryPolicy,
}

impl Default for HealthConfig {
    /// 30 s interval; probes at 3 attempts / 2000 ms / 10 s.
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe: RetryPolicy::default(),
        }
    }
}

pub struct HealthMonitor {
    registry: Arc<ConnectionRegistry>,
    strategy: Arc<dyn ReconnectStrategy>,
    config: HealthConfig,
    ticks: AtomicU64,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        strategy: Arc<dyn ReconnectStrategy>,
        config: HealthConfig,
    ) -> Self {
        Self {
            registry,
            strategy,
            config,
            ticks: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> HealthConfig {
        self.config
    }

    /// Number of completed ticks.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Probe one endpoint and drive its state machine. Returns the resulting health.
    ///
    /// Endpoints that are not connected are skipped and keep their state.
    pub async fn check(&self, identity: Identity) -> HealthState {
        let current = self.registry.snapshot(identity);
        if !current.connected {
            debug!(identity = %identity, "skipping health check: not connected");
            return current.health;
        }

        let probe = match self.registry.connection(identity) {
            Some(conn) => {
                let label = format!("{identity} health check");
                self.config
                    .probe
                    .execute(&label, || {
                        let conn = Arc::clone(&conn);
                        async move { conn.ping().await }
                    })
                    .await
            }
            None => Err(BridgeError::HealthCheck(format!("{identity} has no live connection"))),
        };

        match probe {
            Ok(()) => {
                self.registry.set_health(identity, HealthState::Healthy);
                HealthState::Healthy
            }
            Err(e) => {
                warn!(identity = %identity, error = %e, "health check failed, reconnecting");
                self.registry.set_health(identity, HealthState::Unhealthy);
                match self.strategy.reconnect(&self.registry, identity).await {
                    Ok(snapshot) => snapshot.health,
                    Err(re) => {
                        error!(identity = %identity, error = %re, "reconnect sequence failed");
                        self.registry.mark_failed(identity, &re);
                        HealthState::Error
                    }
                }
            }
        }
    }

    fn spawn_checks(self: &Arc<Self>) -> JoinSet<(Identity, HealthState)> {
        let mut checks = JoinSet::new();
        for identity in Identity::ALL {
            let monitor = Arc::clone(self);
            checks.spawn(async move { (identity, monitor.check(identity).await) });
        }
        checks
    }

    /// Wait for every check; a check that panicked is recorded as an error on its endpoint.
    async fn collect(&self, checks: &mut JoinSet<(Identity, HealthState)>) {
        let mut pending = Identity::ALL.to_vec();
        while let Some(joined) = checks.join_next().await {
            match joined {
                Ok((identity, health)) => {
                    pending.retain(|id| *id != identity);
                    debug!(identity = %identity, health = %health, "health tick");
                }
                Err(e) => error!(error = %e, "health check task crashed"),
            }
        }
        for identity in pending {
            self.registry.record_error(
                identity,
                &BridgeError::HealthCheck("health check task crashed".into()),
            );
        }
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Check both endpoints concurrently, each in its own task.
    pub async fn tick(self: &Arc<Self>) {
        let mut checks = self.spawn_checks();
        self.collect(&mut checks).await;
    }

    /// Tick every `interval` until `shutdown` flips to `true` or its sender drops.
    ///
    /// The first tick happens one full interval after start. A shutdown that
    /// arrives mid-tick aborts the in-flight checks and waits for them to end.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let start = tokio::time::Instant::now() + self.config.interval;
        let mut ticker = tokio::time::interval_at(start, self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(interval_ms = self.config.interval.as_millis() as u64, "health monitor started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop_requested(&mut shutdown) => break,
            }

            let mut checks = self.spawn_checks();
            let stopped = tokio::select! {
                _ = self.collect(&mut checks) => false,
                _ = stop_requested(&mut shutdown) => true,
            };
            if stopped {
                checks.shutdown().await;
                info!("health checks aborted by shutdown");
                break;
            }
        }
        info!("health monitor stopped");
    }
}

/// Resolves once `shutdown` reads `true` or its sender is gone.
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
