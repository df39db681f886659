//! WebSocket client for a collaboration room.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Edit submission against the last confirmed room version
//! - Partial awareness updates
//! - A typed event stream of everything the room sends
//!
//! A client keeps at most one batch in flight: after `send_ops` it must see
//! its own `ops` echo (or a `rejected` reply) before submitting again.
//!
//! The server drops deliveries to a client whose queue is full, so the
//! reader checks that room versions arrive without gaps and reports
//! [`SyncEvent::Desynced`] when one is skipped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::awareness::{AwarenessState, AwarenessUpdate};
use crate::protocol::{ClientId, ClientInfo, ClientMessage, JoinParams, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent<O> {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Room snapshot received after joining
    Synced {
        client_id: ClientId,
        version: u64,
        clients: Vec<ClientInfo>,
        awareness: Vec<AwarenessState>,
    },
    PeerJoined(ClientInfo),
    PeerLeft(ClientId),
    /// An accepted batch, ours included
    Ops {
        version: u64,
        client_id: ClientId,
        ops: Vec<O>,
        own: bool,
    },
    Awareness(AwarenessState),
    /// Our last submission was refused
    Rejected {
        base_version: u64,
        version: u64,
        reason: String,
    },
    /// Versions between the last one seen and `received` never arrived.
    ///
    /// The local document can no longer be trusted; reconnect and rebuild.
    /// Any pending submission is released since its echo may be among the
    /// lost messages.
    Desynced { expected: u64, received: u64 },
}

/// Connection-independent bookkeeping shared with the reader task.
#[derive(Default)]
struct Tracking {
    client_id: RwLock<Option<ClientId>>,
    confirmed_version: AtomicU64,
    in_flight: AtomicBool,
}

/// The sync client.
pub struct SyncClient<O> {
    params: JoinParams,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    tracking: Arc<Tracking>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_rx: Option<mpsc::Receiver<SyncEvent<O>>>,
    event_tx: mpsc::Sender<SyncEvent<O>>,
}

impl<O> SyncClient<O>
where
    O: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Create a client for `room` on `server_url` (e.g. `ws://127.0.0.1:9090`).
    pub fn new(server_url: impl Into<String>, room: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            params: JoinParams {
                room: room.into(),
                ..JoinParams::default()
            },
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            tracking: Arc::new(Tracking::default()),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.params.name = Some(name.into());
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.params.color = Some(color.into());
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent<O>>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let url = self.params.to_url(&self.server_url)?;
        let (ws_stream, _) = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok(ok) => ok,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::Handshake(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel, then close politely.
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_writer.send(msg).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;
        log::info!("Connected to {}", url);

        // Reader task: decode room messages into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let tracking = self.tracking.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let decoded = match msg {
                    Ok(Message::Text(text)) => ServerMessage::<O>::decode(text.as_bytes()),
                    Ok(Message::Binary(data)) => ServerMessage::<O>::decode(&data),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match decoded {
                    Ok(server_msg) => {
                        let mut closed = false;
                        for event in tracking.observe(server_msg).await {
                            if event_tx.send(event).await.is_err() {
                                closed = true;
                                break;
                            }
                        }
                        if closed {
                            break;
                        }
                    }
                    Err(e) => log::debug!("Ignoring undecodable server message: {e}"),
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            tracking.in_flight.store(false, Ordering::SeqCst);
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Submit a batch based on the last confirmed version.
    pub async fn send_ops(&self, ops: Vec<O>) -> Result<(), ProtocolError> {
        self.send_ops_at(self.confirmed_version(), ops).await
    }

    /// Submit a batch authored against `base_version`.
    pub async fn send_ops_at(&self, base_version: u64, ops: Vec<O>) -> Result<(), ProtocolError> {
        let tx = self.sender().await?;
        if self
            .tracking
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ProtocolError::SubmissionInFlight);
        }

        let encoded = ClientMessage::Ops {
            version: base_version,
            ops,
        }
        .encode();
        let sent = match encoded {
            Ok(text) => tx
                .send(Message::Text(text.into()))
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            Err(e) => Err(e),
        };
        if sent.is_err() {
            self.tracking.in_flight.store(false, Ordering::SeqCst);
        }
        sent
    }

    /// Send a partial presence update.
    pub async fn send_awareness(&self, update: AwarenessUpdate) -> Result<(), ProtocolError> {
        let tx = self.sender().await?;
        let text = ClientMessage::<O>::Awareness(update).encode()?;
        tx.send(Message::Text(text.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Close the connection. The server removes us from the room.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    async fn sender(&self) -> Result<&mpsc::Sender<Message>, ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Latest room version seen on the ops stream.
    pub fn confirmed_version(&self) -> u64 {
        self.tracking.confirmed_version.load(Ordering::SeqCst)
    }

    /// Whether a submitted batch is still waiting for its echo.
    pub fn has_pending_submission(&self) -> bool {
        self.tracking.in_flight.load(Ordering::SeqCst)
    }

    /// Id assigned by the room, known once `sync` arrived.
    pub async fn client_id(&self) -> Option<ClientId> {
        self.tracking.client_id.read().await.clone()
    }

    pub fn room(&self) -> &str {
        &self.params.room
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

impl Tracking {
    /// Advance the confirmed version to `version`, returning a gap event when
    /// intermediate versions were skipped.
    fn advance<O>(&self, version: u64) -> Option<SyncEvent<O>> {
        let previous = self.confirmed_version.fetch_max(version, Ordering::SeqCst);
        let expected = previous.saturating_add(1);
        if version <= expected {
            return None;
        }
        log::warn!("Missed room versions {expected}..{version}, client is out of sync");
        self.in_flight.store(false, Ordering::SeqCst);
        Some(SyncEvent::Desynced {
            expected,
            received: version,
        })
    }

    /// Translate one server message into events, gap notices first.
    async fn observe<O>(&self, msg: ServerMessage<O>) -> Vec<SyncEvent<O>> {
        let event = match msg {
            ServerMessage::Sync {
                client_id,
                version,
                clients,
                awareness,
            } => {
                *self.client_id.write().await = Some(client_id.clone());
                self.confirmed_version.store(version, Ordering::SeqCst);
                SyncEvent::Synced {
                    client_id,
                    version,
                    clients,
                    awareness,
                }
            }
            ServerMessage::ClientJoined {
                client_id,
                name,
                color,
            } => SyncEvent::PeerJoined(ClientInfo::with_id(client_id, name, color)),
            ServerMessage::ClientLeft { client_id } => SyncEvent::PeerLeft(client_id),
            ServerMessage::Ops {
                version,
                client_id,
                ops,
            } => {
                let gap = self.advance(version);
                let own = self.client_id.read().await.as_deref() == Some(client_id.as_str());
                if own {
                    self.in_flight.store(false, Ordering::SeqCst);
                }
                let ops = SyncEvent::Ops {
                    version,
                    client_id,
                    ops,
                    own,
                };
                return gap.into_iter().chain(Some(ops)).collect();
            }
            ServerMessage::Awareness { state } => SyncEvent::Awareness(state),
            ServerMessage::Rejected {
                base_version,
                version,
                reason,
            } => {
                // Every version up to `version` was queued before this reply.
                let gap = self.advance(version);
                self.in_flight.store(false, Ordering::SeqCst);
                let rejected = SyncEvent::Rejected {
                    base_version,
                    version,
                    reason,
                };
                return gap.into_iter().chain(Some(rejected)).collect();
            }
        };
        vec![event]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_core::Operation;

    #[test]
    fn test_client_creation() {
        let client = SyncClient::<Operation>::new("ws://127.0.0.1:9090", "notes").with_name("Ada");
        assert_eq!(client.room(), "notes");
        assert_eq!(client.server_url(), "ws://127.0.0.1:9090");
        assert_eq!(client.confirmed_version(), 0);
        assert!(!client.has_pending_submission());
    }

    #[test]
    fn test_take_event_rx_once() {
        let mut client = SyncClient::<Operation>::new("ws://127.0.0.1:9090", "notes");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_send_while_disconnected() {
        let client = SyncClient::<Operation>::new("ws://127.0.0.1:9090", "notes");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(
            client.send_ops(vec![Operation::Noop]).await,
            Err(ProtocolError::ConnectionClosed)
        );
        assert_eq!(
            client.send_awareness(AwarenessUpdate::default()).await,
            Err(ProtocolError::ConnectionClosed)
        );
        assert!(!client.has_pending_submission());
    }

    #[tokio::test]
    async fn test_tracking_follows_stream() {
        let tracking = Tracking::default();
        tracking
            .observe::<Operation>(ServerMessage::Sync {
                client_id: "me".into(),
                version: 4,
                clients: vec![],
                awareness: vec![],
            })
            .await;
        assert_eq!(tracking.confirmed_version.load(Ordering::SeqCst), 4);

        tracking.in_flight.store(true, Ordering::SeqCst);
        let events = tracking
            .observe::<Operation>(ServerMessage::Ops {
                version: 5,
                client_id: "other".into(),
                ops: vec![],
            })
            .await;
        assert!(matches!(events[..], [SyncEvent::Ops { own: false, version: 5, .. }]));
        assert!(tracking.in_flight.load(Ordering::SeqCst));

        let events = tracking
            .observe::<Operation>(ServerMessage::Ops {
                version: 6,
                client_id: "me".into(),
                ops: vec![],
            })
            .await;
        assert!(matches!(events[..], [SyncEvent::Ops { own: true, .. }]));
        assert!(!tracking.in_flight.load(Ordering::SeqCst));
        assert_eq!(tracking.confirmed_version.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_version_gap_reports_desync_and_releases_submission() {
        let tracking = Tracking::default();
        tracking
            .observe::<Operation>(ServerMessage::Sync {
                client_id: "me".into(),
                version: 2,
                clients: vec![],
                awareness: vec![],
            })
            .await;
        tracking.in_flight.store(true, Ordering::SeqCst);

        // Our echo (version 3) was dropped by a full queue; a peer's 4 arrives.
        let events = tracking
            .observe::<Operation>(ServerMessage::Ops {
                version: 4,
                client_id: "peer".into(),
                ops: vec![],
            })
            .await;
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            SyncEvent::Desynced {
                expected: 3,
                received: 4
            }
        );
        assert!(matches!(events[1], SyncEvent::Ops { own: false, version: 4, .. }));
        assert!(!tracking.in_flight.load(Ordering::SeqCst));
        assert_eq!(tracking.confirmed_version.load(Ordering::SeqCst), 4);

        // Back in step: no further notices.
        let events = tracking
            .observe::<Operation>(ServerMessage::Ops {
                version: 5,
                client_id: "peer".into(),
                ops: vec![],
            })
            .await;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_rejection_past_confirmed_version_reports_desync() {
        let tracking = Tracking::default();
        tracking.in_flight.store(true, Ordering::SeqCst);
        let events = tracking
            .observe::<Operation>(ServerMessage::Rejected {
                base_version: 0,
                version: 3,
                reason: "future-version".into(),
            })
            .await;
        assert_eq!(
            events[0],
            SyncEvent::Desynced {
                expected: 1,
                received: 3
            }
        );
        assert!(matches!(events[1], SyncEvent::Rejected { version: 3, .. }));
        assert!(!tracking.in_flight.load(Ordering::SeqCst));
    }

    #[test]
    fn test_connect_url() {
        let client = SyncClient::<Operation>::new("ws://localhost:9090", "team notes")
            .with_name("Ada")
            .with_color("#00ff00");
        let url = client.params.to_url(client.server_url()).unwrap();
        assert_eq!(
            url.as_str(),
            "ws://localhost:9090/team%20notes?name=Ada&color=%2300ff00"
        );
    }
}
