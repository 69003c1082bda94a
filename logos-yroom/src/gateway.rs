//! WebSocket gateway between clients and the worker.
//!
//! ```text
//! Client A ──ws /notes──┐                      ┌──────────────┐
//!                       ├── Gateway ── bus ──► │ worker chan  │
//! Client B ──ws /notes──┘      ▲               └──────┬───────┘
//!                              │   room group /        │
//!                              └── connection group ◄──┘
//! ```
//!
//! Every socket gets a process-unique connection id and its own bus channel.
//! The channel joins the room group (broadcasts) and the connection group
//! (replies meant only for this socket). Binary frames from the client go to
//! the worker as `Message`; forwarded payloads are written back untouched.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::bus::{BusError, MessageBus};
use crate::config::{Settings, NAMESPACE_SEPARATOR};
use crate::protocol::{connection_group, ChannelMessage, ClientMessage, ConnectionId, ProtocolError};

/// Connection ids start at 1; 0 belongs to the worker.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Namespace prepended to the path segment to form the room name
    pub room_prefix: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8765".to_string(),
            room_prefix: "yroom".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Room name for a request path such as `/meeting-notes`.
    pub fn room_for_path(&self, path: &str) -> Option<String> {
        let segment = path.trim_start_matches('/').split('/').next()?;
        if segment.is_empty() {
            return None;
        }
        Some(format!("{}{NAMESPACE_SEPARATOR}{segment}", self.room_prefix))
    }
}

/// Gateway statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_in: u64,
    pub frames_out: u64,
}

#[derive(Default)]
struct AtomicGatewayStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
}

pub struct Gateway<B> {
    config: GatewayConfig,
    settings: Arc<Settings>,
    bus: Arc<B>,
    stats: Arc<AtomicGatewayStats>,
}

impl<B: MessageBus> Gateway<B> {
    pub fn new(config: GatewayConfig, settings: Arc<Settings>, bus: Arc<B>) -> Self {
        Self {
            config,
            settings,
            bus,
            stats: Arc::new(AtomicGatewayStats::default()),
        }
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, GatewayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Gateway listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept connections forever.
    pub async fn serve(&self, listener: TcpListener) {
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("Accept failed: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let session = Session {
                config: self.config.clone(),
                settings: self.settings.clone(),
                bus: self.bus.clone(),
                stats: self.stats.clone(),
            };
            tokio::spawn(async move {
                if let Err(e) = session.handle(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            frames_in: self.stats.frames_in.load(Ordering::Relaxed),
            frames_out: self.stats.frames_out.load(Ordering::Relaxed),
        }
    }
}

/// Everything one connection task needs.
struct Session<B> {
    config: GatewayConfig,
    settings: Arc<Settings>,
    bus: Arc<B>,
    stats: Arc<AtomicGatewayStats>,
}

impl<B: MessageBus> Session<B> {
    async fn handle(self, stream: TcpStream, addr: SocketAddr) -> Result<(), GatewayError> {
        let room_holder: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let room_holder_c = room_holder.clone();
        let config = self.config.clone();

        let ws = tokio_tungstenite::accept_hdr_async(
            stream,
            move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                let Some(room) = config.room_for_path(req.uri().path()) else {
                    log::warn!("Rejecting connection without room: {}", req.uri());
                    let mut response = ErrorResponse::new(Some("Room name required".to_string()));
                    *response.status_mut() = StatusCode::NOT_FOUND;
                    return Err(response);
                };
                if let Ok(mut guard) = room_holder_c.lock() {
                    *guard = Some(room);
                }
                Ok(resp)
            },
        )
        .await?;

        let room = room_holder
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .unwrap_or_default();
        let worker_channel = self.settings.room(&room).channel_name.clone();
        let conn_id = next_connection_id();
        let conn_group = connection_group(conn_id);

        let channel = self.bus.new_channel("yroom-ws").await;
        self.bus.group_add(&room, &channel).await;
        self.bus.group_add(&conn_group, &channel).await;
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("Connection {conn_id} from {addr} joined {room}");

        let result = self
            .relay(ws, &room, conn_id, &channel, &worker_channel)
            .await;

        self.bus.group_discard(&room, &channel).await;
        self.bus.group_discard(&conn_group, &channel).await;
        self.bus.close_channel(&channel).await;
        let leave = ChannelMessage::disconnect(room.as_str(), conn_id).encode()?;
        self.bus.send(&worker_channel, leave).await?;
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection {conn_id} left {room}");

        result
    }

    async fn relay(
        &self,
        ws: tokio_tungstenite::WebSocketStream<TcpStream>,
        room: &str,
        conn_id: ConnectionId,
        channel: &str,
        worker_channel: &str,
    ) -> Result<(), GatewayError> {
        let join = ChannelMessage::connect(room, conn_id).encode()?;
        self.bus.send(worker_channel, join).await?;

        let (mut ws_sender, mut ws_receiver) = ws.split();
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            self.stats.frames_in.fetch_add(1, Ordering::Relaxed);
                            let frame = ChannelMessage::message(room, conn_id, data.to_vec()).encode()?;
                            self.bus.send(worker_channel, frame).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::warn!("WebSocket error on connection {conn_id}: {e}");
                            return Ok(());
                        }
                    }
                }

                frame = self.bus.receive(channel) => {
                    match ClientMessage::decode(&frame?) {
                        Ok(ClientMessage::Forward { payload }) => {
                            self.stats.frames_out.fetch_add(1, Ordering::Relaxed);
                            ws_sender.send(Message::Binary(payload.into())).await?;
                        }
                        Err(e) => log::warn!("Dropping bad frame for connection {conn_id}: {e}"),
                    }
                }
            }
        }
    }
}
