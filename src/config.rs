//! TOML configuration.
//!
//! Every field has a default, so an empty or missing file yields a working
//! local setup: relay on `127.0.0.1:3010`, producer helper on
//! `ws://127.0.0.1:3001/ae-bridge`, consumer API under
//! `http://127.0.0.1:3000/resolve/api/v1/fusion`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::endpoint::Identity;
use crate::bridge::health::{HealthConfig, SequentialReconnect};
use crate::error::{BridgeError, Result};
use crate::retry::{LinearBackoff, RetryPolicy};

pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub log_level: String,
    pub shutdown_grace_ms: u64,
    pub relay: RelayConfig,
    pub retry: RetryConfig,
    pub health: HealthSettings,
    pub client: ClientConfig,
    #[serde(default = "EndpointConfig::producer")]
    pub producer: EndpointConfig,
    #[serde(default = "EndpointConfig::consumer")]
    pub consumer: EndpointConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scripts: Option<ScriptsConfig>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            shutdown_grace_ms: 5000,
            relay: RelayConfig::default(),
            retry: RetryConfig::default(),
            health: HealthSettings::default(),
            client: ClientConfig::default(),
            producer: EndpointConfig::producer(),
            consumer: EndpointConfig::consumer(),
            scripts: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub bind_attempts: u32,
    pub bind_retry_delay_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3010,
            bind_attempts: 3,
            bind_retry_delay_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 2000,
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub interval_ms: u64,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            reconnect_attempts: 3,
            reconnect_delay_ms: 2000,
        }
    }
}

/// Relay-socket client reconnect settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_delay_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_reconnect_attempts: 5,
        }
    }
}

/// Where one bridged application is reached, and optionally where it is installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl EndpointConfig {
    pub fn producer() -> Self {
        Self {
            url: "ws://127.0.0.1:3001/ae-bridge".to_string(),
            path: None,
        }
    }

    pub fn consumer() -> Self {
        Self {
            url: "http://127.0.0.1:3000/resolve/api/v1/fusion".to_string(),
            path: None,
        }
    }
}

/// Producer-side command scripts run by the relay.
///
/// `args` may contain a `{script}` placeholder; without one the script path
/// is appended as the last argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptsConfig {
    #[serde(default = "ScriptsConfig::default_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub get_layers: Option<PathBuf>,
    #[serde(default)]
    pub render: Option<PathBuf>,
    #[serde(default)]
    pub cancel: Option<PathBuf>,
}

impl ScriptsConfig {
    fn default_program() -> String {
        "osascript".to_string()
    }
}

impl BridgeConfig {
    /// Load from `path`, or the defaults when the file does not exist.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| BridgeError::Config(format!("Failed to parse config file: {e}")))
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string(self)
            .map_err(|e| BridgeError::Config(format!("Failed to serialize config: {e}")))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the bridge cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.relay.port < 1024 {
            return Err(BridgeError::Config(format!(
                "relay port {} must be between 1024 and 65535",
                self.relay.port
            )));
        }
        for identity in Identity::ALL {
            self.check_not_relay(identity)?;
        }
        if self.retry.max_attempts == 0 {
            return Err(BridgeError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.health.interval_ms == 0 {
            return Err(BridgeError::Config("health.interval_ms must be positive".into()));
        }
        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(BridgeError::Config(format!(
                "invalid log level {:?}, expected one of {}",
                self.log_level,
                LOG_LEVELS.join(", ")
            )));
        }
        Ok(())
    }

    /// An endpoint URL must not resolve to the relay's own listening address.
    fn check_not_relay(&self, identity: Identity) -> Result<()> {
        let url = &self.endpoint(identity).url;
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| BridgeError::Config(format!("invalid {identity} url {url:?}: {e}")))?;
        let host = parsed.host_str().map(loopback_alias).unwrap_or_default();
        let relay_host = loopback_alias(&self.relay.host);
        let same_host = host == relay_host || relay_host == "0.0.0.0";
        if same_host && parsed.port_or_known_default() == Some(self.relay.port) {
            return Err(BridgeError::Config(format!(
                "{identity} url {url} points at the relay's own address {}",
                self.relay_addr()
            )));
        }
        Ok(())
    }

    pub fn relay_addr(&self) -> String {
        format!("{}:{}", self.relay.host, self.relay.port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.delay_ms),
            Duration::from_millis(self.retry.timeout_ms),
        )
    }

    /// Policy for binding the relay listener. Each bind attempt shares the connect timeout.
    pub fn bind_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.relay.bind_attempts,
            Duration::from_millis(self.relay.bind_retry_delay_ms),
            Duration::from_millis(self.retry.timeout_ms),
        )
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            interval: Duration::from_millis(self.health.interval_ms),
            probe: self.retry_policy(),
        }
    }

    pub fn reconnect_strategy(&self) -> SequentialReconnect {
        SequentialReconnect {
            max_attempts: self.health.reconnect_attempts,
            retry_delay: Duration::from_millis(self.health.reconnect_delay_ms),
        }
    }

    pub fn client_backoff(&self) -> LinearBackoff {
        LinearBackoff::new(
            Duration::from_millis(self.client.base_delay_ms),
            self.client.max_reconnect_attempts,
        )
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn endpoint(&self, identity: Identity) -> &EndpointConfig {
        match identity {
            Identity::Producer => &self.producer,
            Identity::Consumer => &self.consumer,
        }
    }
}

fn loopback_alias(host: &str) -> &str {
    match host {
        "localhost" | "[::1]" | "::1" => "127.0.0.1",
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Host application paths
// ---------------------------------------------------------------------------

/// Outcome of checking one configured host application path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathCheck {
    pub identity: Identity,
    pub path: Option<PathBuf>,
    pub valid: bool,
    pub message: String,
}

/// A host path is usable when it exists and is a file or a macOS `.app` bundle.
pub fn validate_host_path(path: &Path) -> std::result::Result<(), String> {
    let meta = fs::metadata(path).map_err(|_| format!("{} does not exist", path.display()))?;
    if meta.is_file() {
        return Ok(());
    }
    let is_bundle = meta.is_dir() && path.extension().is_some_and(|ext| ext == "app");
    if is_bundle {
        Ok(())
    } else {
        Err(format!("{} is not an executable file or .app bundle", path.display()))
    }
}

/// Check both configured host paths.
pub fn check_paths(config: &BridgeConfig) -> Vec<PathCheck> {
    Identity::ALL
        .into_iter()
        .map(|identity| {
            let path = config.endpoint(identity).path.clone();
            let (valid, message) = match &path {
                None => (false, "not configured".to_string()),
                Some(p) => match validate_host_path(p) {
                    Ok(()) => (true, "ok".to_string()),
                    Err(msg) => (false, msg),
                },
            };
            PathCheck { identity, path, valid, message }
        })
        .collect()
}
