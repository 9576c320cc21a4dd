//! Transports to the two bridged applications.
//!
//! A [`Connector`] knows how to reach one endpoint and hands out a live
//! [`Connection`]. The registry owns at most one connection per endpoint and
//! replaces it on every successful reconnect.
//!
//! - [`ProducerConnector`]: persistent WebSocket to the compositing app's helper server.
//! - [`ConsumerConnector`]: HTTP client against the node-graph app's scripting API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::converter::{LayerDescriptor, NodeDescriptor};
use crate::error::{BridgeError, Result};

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Establishes connections to one endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Human-readable address, used in logs and errors.
    fn target(&self) -> String;

    /// Open a fresh transport. Does not probe capabilities.
    async fn connect(&self) -> Result<Arc<dyn Connection>>;
}

/// A live transport handle for one endpoint.
///
/// Methods take `&self` so a connection can be shared with in-flight retry
/// attempts; implementations serialize access internally.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Liveness probe.
    async fn ping(&self) -> Result<()>;

    /// Capability probe run right after connecting.
    async fn version(&self) -> Result<Option<String>>;

    /// Current layer set. Only the producer supports this.
    async fn fetch_layers(&self) -> Result<Vec<LayerDescriptor>> {
        Err(BridgeError::Protocol("endpoint does not provide layers".into()))
    }

    /// Create a node from a translated layer. Only the consumer supports this.
    async fn create_node(&self, _node: &NodeDescriptor) -> Result<Value> {
        Err(BridgeError::Protocol("endpoint does not accept nodes".into()))
    }

    /// Release the transport.
    async fn close(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Producer: WebSocket
// ---------------------------------------------------------------------------

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to the compositing app's helper server over WebSocket.
#[derive(Debug, Clone)]
pub struct ProducerConnector {
    url: String,
}

impl ProducerConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for ProducerConnector {
    fn target(&self) -> String {
        self.url.clone()
    }

    async fn connect(&self) -> Result<Arc<dyn Connection>> {
        let (ws, _resp) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| BridgeError::connect(&self.url, e))?;
        debug!(url = %self.url, "producer websocket open");
        Ok(Arc::new(ProducerConnection {
            url: self.url.clone(),
            ws: Mutex::new(ws),
        }))
    }
}

/// One open WebSocket to the producer. Requests are strictly one at a time.
pub struct ProducerConnection {
    url: String,
    ws: Mutex<WsStream>,
}

impl ProducerConnection {
    /// Send `request` and wait for the first text frame that `accept` matches.
    ///
    /// Frames that don't match are stale replies to abandoned requests and are
    /// skipped. An `{"error": ...}` reply always matches and becomes
    /// [`BridgeError::Protocol`].
    async fn request(&self, request: Value, accept: fn(&Value) -> bool) -> Result<Value> {
        let mut ws = self.ws.lock().await;
        ws.send(WsMessage::Text(request.to_string()))
            .await
            .map_err(|e| BridgeError::connect(&self.url, e))?;

        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    let value: Value = match serde_json::from_str(&text) {
                        Ok(v) => v,
                        Err(e) => {
                            debug!(url = %self.url, error = %e, "skipping non-JSON frame");
                            continue;
                        }
                    };
                    if let Some(err) = value.get("error").and_then(Value::as_str) {
                        return Err(BridgeError::Protocol(err.to_string()));
                    }
                    if accept(&value) {
                        return Ok(value);
                    }
                    debug!(url = %self.url, "skipping unmatched reply");
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    return Err(BridgeError::connect(&self.url, "connection closed by peer"));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(BridgeError::connect(&self.url, e)),
            }
        }
    }

    async fn pong(&self) -> Result<Value> {
        self.request(json!({"type": "ping"}), |v| v.get("type").and_then(Value::as_str) == Some("pong"))
            .await
    }
}

/// Extract the layer list from a `get-layers` reply: `{"layers": [...]}` or a bare array.
pub fn parse_layers(reply: Value) -> Result<Vec<LayerDescriptor>> {
    let list = match reply {
        Value::Object(mut map) => map
            .remove("layers")
            .ok_or_else(|| BridgeError::Protocol("reply has no `layers` field".into()))?,
        v @ Value::Array(_) => v,
        other => {
            return Err(BridgeError::Protocol(format!("unexpected layers reply: {other}")));
        }
    };
    let items = match list {
        Value::Array(items) => items,
        other => return Err(BridgeError::Protocol(format!("`layers` is not an array: {other}"))),
    };
    // One malformed entry must not hide its siblings.
    let layers = items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<LayerDescriptor>(item) {
            Ok(layer) => Some(layer),
            Err(e) => {
                debug!(error = %e, "skipping malformed layer entry");
                None
            }
        })
        .collect();
    Ok(layers)
}

#[async_trait]
impl Connection for ProducerConnection {
    async fn ping(&self) -> Result<()> {
        self.pong().await.map(|_| ())
    }

    async fn version(&self) -> Result<Option<String>> {
        let pong = self.pong().await?;
        Ok(pong.get("version").and_then(Value::as_str).map(str::to_string))
    }

    async fn fetch_layers(&self) -> Result<Vec<LayerDescriptor>> {
        let reply = self
            .request(json!({"type": "get-layers", "compName": "current"}), |v| {
                v.is_array() || v.get("layers").is_some()
            })
            .await?;
        parse_layers(reply)
    }

    async fn close(&self) -> Result<()> {
        let mut ws = self.ws.lock().await;
        ws.close(None)
            .await
            .map_err(|e| BridgeError::connect(&self.url, e))
    }
}

// ---------------------------------------------------------------------------
// Consumer: HTTP
// ---------------------------------------------------------------------------

/// Connects to the node-graph app's HTTP scripting API.
#[derive(Debug, Clone)]
pub struct ConsumerConnector {
    base_url: String,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl ConsumerConnector {
    /// `base_url` is the API root, e.g. `http://127.0.0.1:3000/resolve/api/v1/fusion`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
        }
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for ConsumerConnector {
    fn target(&self) -> String {
        self.base_url.clone()
    }

    async fn connect(&self) -> Result<Arc<dyn Connection>> {
        // Builder failure only happens in broken TLS environments; fall back to defaults.
        let client = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .timeout(self.request_timeout)
            .build()
            .unwrap_or_default();
        let conn = ConsumerConnection {
            base_url: self.base_url.clone(),
            client,
        };
        // HTTP has no handshake of its own; a status call stands in for it.
        conn.status().await?;
        Ok(Arc::new(conn))
    }
}

/// HTTP client bound to one consumer base URL.
pub struct ConsumerConnection {
    base_url: String,
    client: reqwest::Client,
}

impl ConsumerConnection {
    async fn status(&self) -> Result<reqwest::Response> {
        let url = format!("{}/status", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BridgeError::connect(&url, e))?;
        if !resp.status().is_success() {
            return Err(BridgeError::HealthCheck(format!(
                "HTTP {} from {url}",
                resp.status().as_u16()
            )));
        }
        Ok(resp)
    }
}

#[async_trait]
impl Connection for ConsumerConnection {
    async fn ping(&self) -> Result<()> {
        self.status().await.map(|_| ())
    }

    async fn version(&self) -> Result<Option<String>> {
        let resp = self.status().await?;
        // Older API builds answer with plain text; treat that as "no version".
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        Ok(body.get("version").and_then(Value::as_str).map(str::to_string))
    }

    async fn create_node(&self, node: &NodeDescriptor) -> Result<Value> {
        let url = format!("{}/comp/node", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(node)
            .send()
            .await
            .map_err(|e| BridgeError::connect(&url, e))?;
        if !resp.status().is_success() {
            return Err(BridgeError::Protocol(format!(
                "Failed to create node: HTTP {}",
                resp.status().as_u16()
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| BridgeError::connect(&url, e))?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
