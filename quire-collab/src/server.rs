//! WebSocket transport in front of the room registry.
//!
//! Architecture:
//! ```text
//! ws://host/<room>?name=Ada ──┐
//!                             ├── RoomRegistry ── Room ── BroadcastGroup
//! ws://host/<room>?name=Bob ──┘                              │
//!                                            ┌───────────────┼──────────┐
//!                                            ▼               ▼          ▼
//!                                     mpsc(client A)  mpsc(client B)   …
//!                                            │               │
//!                                      writer half     writer half
//! ```
//!
//! Each connection gets a bounded queue that the room pushes into with
//! `try_send`; the connection task drains it onto the socket. Room
//! membership is held by a [`Seat`], so the client leaves its room on every
//! exit path of the connection task, unwinding included.

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use quire_core::Transform;

use crate::broadcast::ClientHandle;
use crate::protocol::{self, ClientInfo, ClientMessage, JoinParams, ServerMessage};
use crate::registry::{RegistryStatus, RoomRegistry};
use crate::room::{Room, RoomConfig};

type BoxError = Box<dyn Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound messages buffered per client before deliveries are dropped
    pub client_buffer: usize,
    /// Settings applied to every room
    pub room: RoomConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            client_buffer: 256,
            room: RoomConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub malformed_messages: u64,
    pub rejected_submissions: u64,
}

/// State shared by every connection task.
struct Shared<O> {
    config: ServerConfig,
    registry: Arc<RoomRegistry<O>>,
    stats: Arc<RwLock<ServerStats>>,
}

impl<O> Clone for Shared<O> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            registry: self.registry.clone(),
            stats: self.stats.clone(),
        }
    }
}

/// A connection's place in a room.
///
/// `release` leaves the room in line; a seat dropped without it (an error
/// or a panic in the connection task) leaves from a spawned task instead.
struct Seat<O>
where
    O: Transform + Send + Sync + 'static,
{
    registry: Arc<RoomRegistry<O>>,
    stats: Arc<RwLock<ServerStats>>,
    room_id: String,
    client_id: String,
    released: bool,
}

impl<O> Seat<O>
where
    O: Transform + Send + Sync + 'static,
{
    async fn release(mut self) {
        self.released = true;
        Self::vacate(
            self.registry.clone(),
            self.stats.clone(),
            std::mem::take(&mut self.room_id),
            std::mem::take(&mut self.client_id),
        )
        .await;
    }

    async fn vacate(registry: Arc<RoomRegistry<O>>, stats: Arc<RwLock<ServerStats>>, room_id: String, client_id: String) {
        registry.leave(&room_id, &client_id).await;
        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }
}

impl<O> Drop for Seat<O>
where
    O: Transform + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log::error!("Client {} could not leave room {}: no runtime", self.client_id, self.room_id);
            return;
        };
        log::warn!("Connection task for {} ended abruptly, leaving room {}", self.client_id, self.room_id);
        handle.spawn(Self::vacate(
            self.registry.clone(),
            self.stats.clone(),
            std::mem::take(&mut self.room_id),
            std::mem::take(&mut self.client_id),
        ));
    }
}

/// The sync server.
pub struct SyncServer<O> {
    shared: Shared<O>,
}

impl<O> SyncServer<O>
where
    O: Transform + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(RoomRegistry::new(config.room));
        Self {
            shared: Shared {
                config,
                registry,
                stats: Arc::new(RwLock::new(ServerStats::default())),
            },
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind to the configured address and serve until an accept error.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection from handshake to leave.
    async fn handle_connection(stream: TcpStream, addr: SocketAddr, shared: Shared<O>) -> Result<(), BoxError> {
        let mut target = String::from("/");
        let capture_target = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            if let Some(pq) = req.uri().path_and_query() {
                target = pq.as_str().to_string();
            }
            Ok(resp)
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, capture_target).await?;

        let params = JoinParams::from_request_target(&target)?;
        let id = Uuid::new_v4();
        let info = ClientInfo {
            id: id.to_string(),
            name: params.name.unwrap_or_else(|| protocol::ANONYMOUS.to_string()),
            color: params.color.unwrap_or_else(|| protocol::color_for(id)),
        };
        let client_id = info.id.clone();

        let (tx, rx) = mpsc::channel::<Arc<ServerMessage<O>>>(shared.config.client_buffer.max(1));
        let room = shared
            .registry
            .join(&params.room, ClientHandle::new(info, Arc::new(tx)))
            .await?;

        let seat = Seat {
            registry: shared.registry.clone(),
            stats: shared.stats.clone(),
            room_id: params.room.clone(),
            client_id: client_id.clone(),
            released: false,
        };
        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }
        log::info!("WebSocket client {client_id} from {addr} in room {}", params.room);

        let result = Self::pump(ws_stream, rx, &room, &client_id, addr, &shared).await;

        seat.release().await;
        log::info!("Connection closed for client {client_id} from {addr}");
        result
    }

    /// Shuttle frames between the socket and the room until either side ends.
    async fn pump(
        ws_stream: WebSocketStream<TcpStream>,
        mut outbound: mpsc::Receiver<Arc<ServerMessage<O>>>,
        room: &Room<O>,
        client_id: &str,
        addr: SocketAddr,
        shared: &Shared<O>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(reply) = Self::dispatch(text.as_bytes(), room, client_id, addr, shared).await {
                                Self::reply(&mut ws_sender, &mut outbound, reply).await?;
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            if let Some(reply) = Self::dispatch(&data, room, client_id, addr, shared).await {
                                Self::reply(&mut ws_sender, &mut outbound, reply).await?;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                // Outgoing room message
                out = outbound.recv() => {
                    match out {
                        Some(msg) => {
                            let text = msg.encode()?;
                            ws_sender.send(Message::Text(text.into())).await?;
                        }
                        None => break,
                    }
                }
            }
        }
        Ok(())
    }

    /// Send a direct reply after everything already queued for this client.
    ///
    /// Room deliveries are queued under the room lock, so every version the
    /// reply may mention is in the queue by now.
    async fn reply(
        ws_sender: &mut WsSink,
        outbound: &mut mpsc::Receiver<Arc<ServerMessage<O>>>,
        reply: ServerMessage<O>,
    ) -> Result<(), BoxError> {
        while let Ok(queued) = outbound.try_recv() {
            ws_sender.send(Message::Text(queued.encode()?.into())).await?;
        }
        ws_sender.send(Message::Text(reply.encode()?.into())).await?;
        Ok(())
    }

    /// Apply one client frame to the room, returning a reply for the sender.
    async fn dispatch(
        bytes: &[u8],
        room: &Room<O>,
        client_id: &str,
        addr: SocketAddr,
        shared: &Shared<O>,
    ) -> Option<ServerMessage<O>> {
        {
            let mut s = shared.stats.write().await;
            s.total_messages += 1;
            s.total_bytes += bytes.len() as u64;
        }

        let msg = match ClientMessage::<O>::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("Dropping malformed message from {addr}: {e}");
                shared.stats.write().await.malformed_messages += 1;
                return None;
            }
        };

        match msg {
            ClientMessage::Ops { version, ops } => {
                if let Err(e) = room.submit_ops(client_id, version, ops).await {
                    log::debug!("Rejected submission from {client_id}: {e}");
                    shared.stats.write().await.rejected_submissions += 1;
                    return Some(ServerMessage::Rejected {
                        base_version: version,
                        version: room.version().await,
                        reason: e.reason().to_string(),
                    });
                }
            }
            ClientMessage::Awareness(update) => {
                room.update_awareness(client_id, update).await;
            }
        }
        None
    }

    /// `{status, rooms, clients}` snapshot.
    pub async fn status(&self) -> RegistryStatus {
        self.shared.registry.status().await
    }

    pub async fn stats(&self) -> ServerStats {
        self.shared.stats.read().await.clone()
    }

    pub fn registry(&self) -> &Arc<RoomRegistry<O>> {
        &self.shared.registry
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }
}
