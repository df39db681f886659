//! A collaborative editing session for one document.
//!
//! The room owns the authoritative version counter, the operation log, the
//! awareness map and the membership. All four live behind one async mutex so
//! that join, leave, submit and awareness updates run one at a time in
//! arrival order. Broadcasts go out while the lock is held, which keeps every
//! member's `ops` stream in version order.
//!
//! ```text
//! submit_ops(c, base, ops)
//!   ├─ base > version        → Err(FutureVersion)      nothing changes
//!   ├─ base < trimmed window → Err(HistoryTrimmed)     nothing changes
//!   └─ resolve(ops, log[base+1..] not by c)
//!        version += 1, log.append, broadcast_all(ops)  → Ok(version)
//! ```

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::Mutex;

use quire_core::Transform;

use crate::awareness::{self, AwarenessState, AwarenessUpdate};
use crate::broadcast::{BroadcastGroup, BroadcastStats, ClientHandle};
use crate::oplog::{LogEntry, LogError, OperationLog, Retention};
use crate::protocol::{ClientId, ClientInfo, ServerMessage};
use crate::resolver;

/// Per-room settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoomConfig {
    pub retention: Retention,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoomError {
    #[error("client {0} is already a member")]
    DuplicateClient(ClientId),
    #[error("room {0} has been closed")]
    Closed(String),
}

/// Why a submission was refused. The room is unchanged in every case.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("client {0} is not a member of this room")]
    UnknownClient(ClientId),
    #[error("base version {base} is ahead of room version {current}")]
    FutureVersion { base: u64, current: u64 },
    #[error("base version {base} predates retained history (oldest retained entry {oldest})")]
    HistoryTrimmed { base: u64, oldest: u64 },
}

impl SubmitError {
    /// Short machine-readable code for `rejected` replies.
    pub fn reason(&self) -> &'static str {
        match self {
            SubmitError::UnknownClient(_) => "unknown-client",
            SubmitError::FutureVersion { .. } => "future-version",
            SubmitError::HistoryTrimmed { .. } => "history-trimmed",
        }
    }
}

impl From<LogError> for SubmitError {
    fn from(err: LogError) -> Self {
        match err {
            LogError::HistoryTrimmed { base, oldest } => SubmitError::HistoryTrimmed { base, oldest },
        }
    }
}

struct RoomState<O> {
    version: u64,
    peers: BroadcastGroup<O>,
    log: OperationLog<O>,
    awareness: HashMap<ClientId, AwarenessState>,
    /// Set once the registry has removed this room; later joins must go to a
    /// fresh room.
    closed: bool,
}

pub struct Room<O> {
    id: String,
    state: Mutex<RoomState<O>>,
}

impl<O> Room<O>
where
    O: Transform + Send + Sync + 'static,
{
    pub fn new(id: impl Into<String>, config: RoomConfig) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(RoomState {
                version: 0,
                peers: BroadcastGroup::new(),
                log: OperationLog::new(config.retention),
                awareness: HashMap::new(),
                closed: false,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register `client`, announce it to the existing members and send it
    /// the `sync` snapshot.
    pub async fn join(&self, client: ClientHandle<O>) -> Result<(), RoomError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(RoomError::Closed(self.id.clone()));
        }
        if state.peers.contains(client.id()) {
            return Err(RoomError::DuplicateClient(client.info.id.clone()));
        }

        let info = client.info.clone();
        let roster = state.peers.infos();
        let awareness: Vec<AwarenessState> = state.awareness.values().cloned().collect();

        state.peers.broadcast_all(ServerMessage::ClientJoined {
            client_id: info.id.clone(),
            name: info.name.clone(),
            color: info.color.clone(),
        });
        state.peers.add_peer(client);
        state.peers.send_to(
            &info.id,
            ServerMessage::Sync {
                client_id: info.id.clone(),
                version: state.version,
                clients: roster,
                awareness,
            },
        );

        log::info!(
            "Client {} ({}) joined room {} ({} members)",
            info.id,
            info.name,
            self.id,
            state.peers.len()
        );
        Ok(())
    }

    /// Remove a member and its awareness. Returns the remaining member count.
    pub async fn leave(&self, client_id: &str) -> usize {
        let mut state = self.state.lock().await;
        if state.peers.remove_peer(client_id).is_some() {
            state.awareness.remove(client_id);
            state.peers.broadcast_all(ServerMessage::ClientLeft {
                client_id: client_id.to_string(),
            });
            log::info!(
                "Client {} left room {} ({} members)",
                client_id,
                self.id,
                state.peers.len()
            );
        }
        state.peers.len()
    }

    /// Accept an edit batch authored at `base_version`, rebasing it over
    /// concurrent history. Returns the new room version.
    pub async fn submit_ops(
        &self,
        client_id: &str,
        base_version: u64,
        ops: Vec<O>,
    ) -> Result<u64, SubmitError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if !state.peers.contains(client_id) {
            return Err(SubmitError::UnknownClient(client_id.to_string()));
        }
        if base_version > state.version {
            log::debug!(
                "Rejected ops from {} in room {}: base v{} > v{}",
                client_id,
                self.id,
                base_version,
                state.version
            );
            return Err(SubmitError::FutureVersion {
                base: base_version,
                current: state.version,
            });
        }

        let submitted = ops.len();
        let transformed = {
            let concurrent = state
                .log
                .concurrent_since(base_version, client_id)?
                .flat_map(|entry| entry.ops.iter().map(move |op| (entry.client_id.as_str(), op)));
            resolver::resolve(client_id, ops, concurrent)
        };

        state.version += 1;
        let version = state.version;
        state.log.append(LogEntry {
            version,
            client_id: client_id.to_string(),
            ops: transformed.clone(),
        });

        log::debug!(
            "Room {} v{}: {} ops from {} (base v{}, {} after transform)",
            self.id,
            version,
            submitted,
            client_id,
            base_version,
            transformed.len()
        );

        state.peers.broadcast_all(ServerMessage::Ops {
            version,
            client_id: client_id.to_string(),
            ops: transformed,
        });
        Ok(version)
    }

    /// Merge a partial presence update and relay it to the other members.
    /// Returns `None` when `client_id` is not a member.
    pub async fn update_awareness(
        &self,
        client_id: &str,
        update: AwarenessUpdate,
    ) -> Option<AwarenessState> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let info = state.peers.get(client_id)?.info.clone();
        let merged = awareness::merge(state.awareness.get(client_id), update, &info);
        state
            .awareness
            .insert(client_id.to_string(), merged.clone());

        log::trace!("Awareness from {} in room {}", client_id, self.id);
        state.peers.broadcast_except(
            client_id,
            ServerMessage::Awareness {
                state: merged.clone(),
            },
        );
        Some(merged)
    }

    pub async fn version(&self) -> u64 {
        self.state.lock().await.version
    }

    pub async fn client_count(&self) -> usize {
        self.state.lock().await.peers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.peers.is_empty()
    }

    pub async fn clients(&self) -> Vec<ClientInfo> {
        self.state.lock().await.peers.infos()
    }

    pub async fn awareness_of(&self, client_id: &str) -> Option<AwarenessState> {
        self.state.lock().await.awareness.get(client_id).cloned()
    }

    /// Snapshot of the retained log, oldest first.
    pub async fn history(&self) -> Vec<LogEntry<O>> {
        self.state.lock().await.log.iter().cloned().collect()
    }

    pub async fn broadcast_stats(&self) -> BroadcastStats {
        self.state.lock().await.peers.stats()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Mark the room closed if it has no members. Returns whether it is closed.
    pub(crate) async fn close_if_empty(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.peers.is_empty() {
            state.closed = true;
        }
        state.closed
    }
}
