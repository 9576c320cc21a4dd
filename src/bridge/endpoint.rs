//! Endpoint identities and per-endpoint state records.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix epoch in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// One of the two bridged applications.
///
/// Serialized with the wire names the host-side helpers use: `"ae"` for the
/// producer (compositing app) and `"resolve"` for the consumer (node-graph app).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Identity {
    #[serde(rename = "ae")]
    Producer,
    #[serde(rename = "resolve")]
    Consumer,
}

impl Identity {
    pub const ALL: [Identity; 2] = [Identity::Producer, Identity::Consumer];

    /// The opposite endpoint.
    pub fn other(self) -> Identity {
        match self {
            Identity::Producer => Identity::Consumer,
            Identity::Consumer => Identity::Producer,
        }
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            Identity::Producer => "ae",
            Identity::Consumer => "resolve",
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl std::str::FromStr for Identity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ae" | "producer" | "after-effects" => Ok(Identity::Producer),
            "resolve" | "consumer" | "davinci-resolve" => Ok(Identity::Consumer),
            other => Err(format!("unknown endpoint identity: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// HealthState
// ---------------------------------------------------------------------------

/// Liveness classification of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
    Error,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Error => "error",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// Read-only copy of an [`Endpoint`] as exposed on the status surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSnapshot {
    pub connected: bool,
    pub configured: bool,
    pub health: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl EndpointSnapshot {
    /// Both flags a sync requires.
    pub fn is_ready(&self) -> bool {
        self.connected && self.health == HealthState::Healthy
    }
}

/// The mutable state record for one endpoint.
///
/// One record per [`Identity`] lives for the whole orchestrator lifetime.
/// Transitions are crate-private so only the registry and the health monitor
/// can drive them.
#[derive(Debug, Clone)]
pub struct Endpoint {
    identity: Identity,
    connected: bool,
    configured: bool,
    health: HealthState,
    last_sync_at: Option<u64>,
    version: Option<String>,
    last_error: Option<String>,
}

impl Endpoint {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            connected: false,
            configured: false,
            health: HealthState::Unknown,
            last_sync_at: None,
            version: None,
            last_error: None,
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn health(&self) -> HealthState {
        self.health
    }

    pub fn snapshot(&self) -> EndpointSnapshot {
        EndpointSnapshot {
            connected: self.connected,
            configured: self.configured,
            health: self.health,
            last_sync_at: self.last_sync_at,
            version: self.version.clone(),
            last_error: self.last_error.clone(),
        }
    }

    /// A connect + capability probe succeeded.
    pub(crate) fn mark_connected(&mut self, version: Option<String>) {
        self.connected = true;
        self.configured = true;
        self.health = HealthState::Healthy;
        self.last_sync_at = Some(now_ms());
        self.version = version;
        self.last_error = None;
    }

    /// Connecting failed for good; keeps `configured` and `version` as they were.
    pub(crate) fn mark_failed(&mut self, error: &str) {
        self.connected = false;
        self.health = HealthState::Error;
        self.last_error = Some(error.to_string());
    }

    pub(crate) fn set_health(&mut self, health: HealthState) {
        self.health = health;
    }

    pub(crate) fn record_error(&mut self, error: &str) {
        self.last_error = Some(error.to_string());
    }

    pub(crate) fn touch_sync(&mut self) {
        self.last_sync_at = Some(now_ms());
    }

    /// Back to the construction state; the record itself is never dropped.
    pub(crate) fn reset(&mut self) {
        *self = Endpoint::new(self.identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_other_is_involution() {
        for id in Identity::ALL {
            assert_ne!(id.other(), id);
            assert_eq!(id.other().other(), id);
        }
    }

    #[test]
    fn test_identity_serializes_with_wire_names() {
        assert_eq!(serde_json::to_string(&Identity::Producer).unwrap(), "\"ae\"");
        assert_eq!(serde_json::to_string(&Identity::Consumer).unwrap(), "\"resolve\"");
    }

    #[test]
    fn test_identity_parse_aliases() {
        assert_eq!("ae".parse::<Identity>().unwrap(), Identity::Producer);
        assert_eq!("Producer".parse::<Identity>().unwrap(), Identity::Producer);
        assert_eq!("davinci-resolve".parse::<Identity>().unwrap(), Identity::Consumer);
        assert!("premiere".parse::<Identity>().is_err());
    }

    #[test]
    fn test_new_endpoint_is_unknown_and_disconnected() {
        let ep = Endpoint::new(Identity::Producer);
        let snap = ep.snapshot();
        assert!(!snap.connected);
        assert!(!snap.configured);
        assert_eq!(snap.health, HealthState::Unknown);
        assert!(snap.last_sync_at.is_none());
    }

    #[test]
    fn test_mark_connected_sets_all_flags() {
        let mut ep = Endpoint::new(Identity::Consumer);
        ep.mark_failed("boom");
        ep.mark_connected(Some("18.6".into()));
        let snap = ep.snapshot();
        assert!(snap.connected && snap.configured);
        assert_eq!(snap.health, HealthState::Healthy);
        assert_eq!(snap.version.as_deref(), Some("18.6"));
        assert!(snap.last_error.is_none());
        assert!(snap.last_sync_at.is_some());
        assert!(snap.is_ready());
    }

    #[test]
    fn test_mark_failed_keeps_configured() {
        let mut ep = Endpoint::new(Identity::Producer);
        ep.mark_connected(None);
        ep.mark_failed("connection refused");
        let snap = ep.snapshot();
        assert!(!snap.connected);
        assert!(snap.configured);
        assert_eq!(snap.health, HealthState::Error);
        assert_eq!(snap.last_error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_connected_but_unhealthy_is_not_ready() {
        let mut ep = Endpoint::new(Identity::Producer);
        ep.mark_connected(None);
        ep.set_health(HealthState::Unhealthy);
        assert!(!ep.snapshot().is_ready());
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let mut ep = Endpoint::new(Identity::Consumer);
        ep.mark_connected(Some("1".into()));
        ep.reset();
        assert_eq!(ep.identity(), Identity::Consumer);
        assert_eq!(ep.snapshot(), Endpoint::new(Identity::Consumer).snapshot());
    }

    #[test]
    fn test_snapshot_json_is_camel_case_and_skips_none() {
        let mut ep = Endpoint::new(Identity::Producer);
        ep.mark_failed("x");
        let v = serde_json::to_value(ep.snapshot()).unwrap();
        assert_eq!(v["health"], "error");
        assert_eq!(v["lastError"], "x");
        assert!(v.get("version").is_none());
        assert!(v.get("lastSyncAt").is_none());
    }
}
