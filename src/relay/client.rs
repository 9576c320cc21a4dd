//! Relay-socket client used by the host-side helpers.
//!
//! Connects to the hub, registers its role and keeps the session alive. After
//! a disconnect it reconnects with [`LinearBackoff`] (`base * attempt`) until
//! the attempt budget runs out; every successful reconnect resets the counter
//! and re-registers.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::envelope::Envelope;
use crate::bridge::endpoint::Identity;
use crate::error::{BridgeError, Result};
use crate::retry::LinearBackoff;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct RelayClient {
    role: Identity,
    outbound: mpsc::UnboundedSender<WsMessage>,
    connected: Arc<AtomicBool>,
    attempts: Arc<AtomicU32>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RelayClient {
    /// Connect, register as `role` and start the session task.
    ///
    /// The first connect is not retried. Inbound envelopes (parsed JSON) arrive
    /// on the returned receiver; non-JSON frames are skipped.
    pub async fn connect(
        url: impl Into<String>,
        role: Identity,
        backoff: LinearBackoff,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Value>)> {
        let url = url.into();
        let ws = open(&url, role).await?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let connected = Arc::new(AtomicBool::new(true));
        let attempts = Arc::new(AtomicU32::new(0));

        let session = Session {
            url,
            role,
            backoff,
            connected: Arc::clone(&connected),
            attempts: Arc::clone(&attempts),
            inbound: inbound_tx,
            outbound: outbound_rx,
            stop: stop_rx,
        };
        let task = tokio::spawn(session.run(ws));

        let client = Self {
            role,
            outbound: outbound_tx,
            connected,
            attempts,
            stop: stop_tx,
            task,
        };
        Ok((client, inbound_rx))
    }

    pub fn role(&self) -> Identity {
        self.role
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Reconnect attempts used since the last successful connection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Send `data` to the other side, wrapped as `ae_data` / `resolve_data` by role.
    pub fn send_data(&self, data: Value) -> Result<()> {
        self.send(&json!({ "type": Envelope::data_tag(self.role), "data": data }))
    }

    /// Send a raw envelope. Fails while the session is disconnected.
    pub fn send(&self, envelope: &Value) -> Result<()> {
        if !self.is_connected() {
            return Err(BridgeError::connect("relay", "not connected"));
        }
        self.outbound
            .send(WsMessage::Text(envelope.to_string()))
            .map_err(|_| BridgeError::connect("relay", "session ended"))
    }

    /// Close the socket and stop reconnecting.
    pub async fn close(self) {
        self.stop.send_replace(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "relay client task failed");
        }
    }
}

async fn open(url: &str, role: Identity) -> Result<WsStream> {
    let (mut ws, _resp) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| BridgeError::connect(url, e))?;
    let register = json!({ "type": "register", "client": role.wire_name() });
    ws.send(WsMessage::Text(register.to_string()))
        .await
        .map_err(|e| BridgeError::connect(url, e))?;
    info!(url, role = %role, "registered with relay");
    Ok(ws)
}

enum Exit {
    Stopped,
    Disconnected,
}

struct Session {
    url: String,
    role: Identity,
    backoff: LinearBackoff,
    connected: Arc<AtomicBool>,
    attempts: Arc<AtomicU32>,
    inbound: mpsc::UnboundedSender<Value>,
    outbound: mpsc::UnboundedReceiver<WsMessage>,
    stop: watch::Receiver<bool>,
}

impl Session {
    async fn run(mut self, mut ws: WsStream) {
        loop {
            let exit = self.pump(&mut ws).await;
            self.connected.store(false, Ordering::SeqCst);
            match exit {
                Exit::Stopped => {
                    let _ = ws.close(None).await;
                    debug!(role = %self.role, "relay client closed");
                    return;
                }
                Exit::Disconnected => {
                    warn!(role = %self.role, "relay connection lost");
                    match self.reconnect().await {
                        Some(fresh) => ws = fresh,
                        None => return,
                    }
                }
            }
        }
    }

    async fn pump(&mut self, ws: &mut WsStream) -> Exit {
        loop {
            tokio::select! {
                frame = ws.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<Value>(&text) {
                        Ok(value) => {
                            if self.inbound.send(value).is_err() {
                                debug!(role = %self.role, "inbound receiver dropped");
                            }
                        }
                        Err(e) => debug!(role = %self.role, error = %e, "skipping non-JSON frame"),
                    },
                    Some(Ok(WsMessage::Close(_))) | None => return Exit::Disconnected,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(role = %self.role, error = %e, "relay read failed");
                        return Exit::Disconnected;
                    }
                },
                msg = self.outbound.recv() => match msg {
                    Some(msg) => {
                        if let Err(e) = ws.send(msg).await {
                            debug!(role = %self.role, error = %e, "relay send failed");
                            return Exit::Disconnected;
                        }
                    }
                    None => return Exit::Stopped,
                },
                _ = self.stop.changed() => return Exit::Stopped,
            }
        }
    }

    async fn reconnect(&mut self) -> Option<WsStream> {
        loop {
            let Some(delay) = self.backoff.next_delay() else {
                warn!(
                    role = %self.role,
                    attempts = self.backoff.attempts(),
                    "max reconnect attempts reached"
                );
                return None;
            };
            let attempt = self.backoff.attempts();
            self.attempts.store(attempt, Ordering::SeqCst);
            info!(
                role = %self.role,
                attempt,
                max_attempts = self.backoff.max_attempts(),
                delay_ms = delay.as_millis() as u64,
                "reconnecting to relay"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.stop.changed() => return None,
            }

            match open(&self.url, self.role).await {
                Ok(ws) => {
                    self.backoff.reset();
                    self.attempts.store(0, Ordering::SeqCst);
                    self.connected.store(true, Ordering::SeqCst);
                    info!(role = %self.role, "reconnected to relay");
                    return Some(ws);
                }
                Err(e) => warn!(role = %self.role, attempt, error = %e, "relay reconnect failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_connect_refused_is_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = RelayClient::connect(
            format!("ws://{addr}"),
            Identity::Producer,
            LinearBackoff::new(Duration::from_millis(1), 1),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.kind(), "connect");
    }
}
