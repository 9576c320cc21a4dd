//! The relay hub: one listener, WebSocket clients tagged by role, plain-HTTP probes.
//!
//! ```text
//!   producer ws ──register{ae}──►┐             ┌──► consumer ws
//!                                │  RelayHub   │
//!   ae_data ────────────────────►│ role → tx   │──── verbatim ───►
//!   ◄──────────── verbatim ──────│             │◄──── resolve_data
//!                                └─────────────┘
//!   GET /health, GET /status ──► JSON
//! ```
//!
//! Each connection gets one reader loop and one writer task. Frames from a
//! connection are handled strictly in arrival order; producer commands run
//! in their own tasks and reply through the writer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::envelope::{classify, error_reply, pong, Envelope};
use super::scripts::HostCommands;
use crate::bridge::endpoint::Identity;
use crate::error::{BridgeError, Result};
use crate::retry::RetryPolicy;

pub const NO_HANDLER: &str = "No producer command handler";

#[derive(Clone)]
struct ClientHandle {
    id: Uuid,
    tx: mpsc::UnboundedSender<WsMessage>,
}

enum HostCommand {
    GetLayers(Option<String>),
    Render(Value),
    Cancel,
}

struct Shared {
    clients: Mutex<HashMap<Identity, ClientHandle>>,
    commands: Option<Arc<dyn HostCommands>>,
}

impl Shared {
    fn clients(&self) -> MutexGuard<'_, HashMap<Identity, ClientHandle>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, role: Identity, handle: ClientHandle) {
        let id = handle.id;
        if let Some(prev) = self.clients().insert(role, handle) {
            if prev.id != id {
                info!(role = %role, previous = %prev.id, connection = %id, "role re-registered, last registration wins");
                return;
            }
        }
        info!(role = %role, connection = %id, "client registered");
    }

    /// Drop `role` only if it still points at connection `id`.
    fn unregister(&self, role: Identity, id: Uuid) {
        let mut clients = self.clients();
        if clients.get(&role).is_some_and(|h| h.id == id) {
            clients.remove(&role);
            info!(role = %role, connection = %id, "client disconnected");
        }
    }

    fn forward(&self, target: Identity, text: String) {
        let peer = self.clients().get(&target).map(|h| h.tx.clone());
        match peer {
            None => debug!(target = %target, "no client registered for target, dropping data envelope"),
            Some(tx) => {
                if tx.send(WsMessage::Text(text)).is_err() {
                    debug!(target = %target, "target connection closing, dropping data envelope");
                }
            }
        }
    }

    fn status_json(&self) -> Value {
        let clients = self.clients();
        json!({
            "aeConnected": clients.contains_key(&Identity::Producer),
            "resolveConnected": clients.contains_key(&Identity::Consumer),
            "bridgeStatus": "running",
        })
    }

    fn dispatch(
        &self,
        conn_id: Uuid,
        role: &mut Option<Identity>,
        text: String,
        tx: &mpsc::UnboundedSender<WsMessage>,
    ) {
        let envelope = match classify(&text) {
            Ok(env) => env,
            Err(rejection) => {
                debug!(connection = %conn_id, reason = ?rejection, "rejected frame");
                send(tx, rejection.reply());
                return;
            }
        };

        match envelope {
            Envelope::Register { client } => {
                if let Some(prev) = role.replace(client) {
                    if prev != client {
                        self.unregister(prev, conn_id);
                    }
                }
                self.register(client, ClientHandle { id: conn_id, tx: tx.clone() });
            }
            Envelope::Data { origin } => self.forward(origin.other(), text),
            Envelope::Ping => send(tx, pong()),
            Envelope::GetLayers { comp_name } => self.spawn_command(HostCommand::GetLayers(comp_name), tx),
            Envelope::RenderComposition { request } => self.spawn_command(HostCommand::Render(request), tx),
            Envelope::CancelRender => self.spawn_command(HostCommand::Cancel, tx),
        }
    }

    fn spawn_command(&self, command: HostCommand, tx: &mpsc::UnboundedSender<WsMessage>) {
        let Some(commands) = self.commands.clone() else {
            send(tx, error_reply(NO_HANDLER));
            return;
        };
        let tx = tx.clone();
        tokio::spawn(async move {
            match command {
                HostCommand::GetLayers(comp_name) => match commands.get_layers(comp_name.as_deref()).await {
                    Ok(out) => send(&tx, out.trim().to_string()),
                    Err(e) => send(&tx, error_reply(&reply_message(&e))),
                },
                HostCommand::Render(request) => match commands.render(&request).await {
                    Ok(progress) => {
                        send(&tx, json!({"status": "rendering", "progress": progress}).to_string());
                        send(&tx, json!({"status": "completed"}).to_string());
                    }
                    Err(e) => send(&tx, error_reply(&reply_message(&e))),
                },
                HostCommand::Cancel => {
                    if let Err(e) = commands.cancel_render().await {
                        warn!(error = %e, "cancel-render failed");
                    }
                    send(&tx, json!({"status": "cancelled"}).to_string());
                }
            }
        });
    }
}

fn send(tx: &mpsc::UnboundedSender<WsMessage>, text: String) {
    let _ = tx.send(WsMessage::Text(text));
}

/// Protocol errors carry a message meant for the peer; everything else is shown in full.
fn reply_message(e: &BridgeError) -> String {
    match e {
        BridgeError::Protocol(msg) => msg.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// RelayHub
// ---------------------------------------------------------------------------

pub struct RelayHub {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
}

impl RelayHub {
    /// Bind the listener, retrying under `policy`. Exhaustion is [`BridgeError::Bind`].
    pub async fn bind(addr: &str, policy: RetryPolicy) -> Result<Self> {
        let listener = policy
            .execute("bind relay", || async move {
                TcpListener::bind(addr).await.map_err(|e| BridgeError::Bind {
                    addr: addr.to_string(),
                    detail: e.to_string(),
                })
            })
            .await
            .map_err(|e| match e {
                bind @ BridgeError::Bind { .. } => bind,
                other => BridgeError::Bind {
                    addr: addr.to_string(),
                    detail: other.to_string(),
                },
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            shared: Arc::new(Shared {
                clients: Mutex::new(HashMap::new()),
                commands: None,
            }),
        })
    }

    /// Install the producer command handler. Without one, commands get an error reply.
    pub fn with_commands(mut self, commands: Arc<dyn HostCommands>) -> Self {
        self.shared = Arc::new(Shared {
            clients: Mutex::new(HashMap::new()),
            commands: Some(commands),
        });
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_registered(&self, role: Identity) -> bool {
        self.shared.clients().contains_key(&role)
    }

    /// Accept connections until `shutdown` flips to `true`, then close every
    /// client, stop running commands and wait for connection tasks to end.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(addr = %self.local_addr, "relay listening");
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let shared = Arc::clone(&self.shared);
                        let shutdown = shutdown.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, shared, shutdown).await {
                                debug!(peer = %peer, error = %e, "relay connection error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "relay accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        info!(open = connections.len(), "relay shutting down");
        if let Some(commands) = &self.shared.commands {
            commands.shutdown().await;
        }
        while connections.join_next().await.is_some() {}
        self.shared.clients().clear();
        info!("relay stopped");
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut peek_buf = [0u8; 1024];
    let peek_n = stream.peek(&mut peek_buf).await?;
    let head = String::from_utf8_lossy(&peek_buf[..peek_n]).to_ascii_lowercase();

    if head.contains("upgrade: websocket") {
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| BridgeError::Protocol(format!("websocket handshake failed: {e}")))?;
        serve_socket(ws, shared, shutdown).await;
        return Ok(());
    }

    let mut buf = vec![0u8; 4096];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);
    let target = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");
    let path = target.split('?').next().unwrap_or(target);

    let (status, body) = match path {
        "/health" => ("200 OK", json!({"status": "healthy"})),
        "/status" => ("200 OK", shared.status_json()),
        _ => ("404 Not Found", json!({"error": "Not found"})),
    };
    let body = body.to_string();
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );
    stream.write_all(response.as_bytes()).await?;
    let _ = stream.shutdown().await;
    Ok(())
}

async fn serve_socket(
    ws: WebSocketStream<TcpStream>,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let conn_id = Uuid::new_v4();
    let (mut sink, mut frames) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, WsMessage::Close(_));
            if let Err(e) = sink.send(msg).await {
                debug!(connection = %conn_id, error = %e, "relay send failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    debug!(connection = %conn_id, "relay client connected");
    let mut role: Option<Identity> = None;
    if !*shutdown.borrow() {
        loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => shared.dispatch(conn_id, &mut role, text, &tx),
                    Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => shared.dispatch(conn_id, &mut role, text, &tx),
                        Err(_) => send(&tx, error_reply(super::envelope::INVALID_FORMAT)),
                    },
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(connection = %conn_id, error = %e, "relay read failed");
                        break;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    if let Some(r) = role {
        shared.unregister(r, conn_id);
    }
    let _ = tx.send(WsMessage::Close(None));
    drop(tx);
    if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
        debug!(connection = %conn_id, "writer did not finish closing");
    }
}
