//! Best-effort fan-out to the members of one room.
//!
//! Each member is reached through a [`ClientSink`]. Delivery never blocks and
//! never fails the caller: a full or closed sink counts as a dropped message
//! and the member stays registered until the transport calls `leave`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{ClientId, ClientInfo, ServerMessage};

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("client queue is full")]
    Full,
    #[error("client connection is closed")]
    Closed,
}

/// Push capability for one connected client.
///
/// Implementations must not block; the room calls this while holding its lock.
pub trait ClientSink<O>: Send + Sync {
    fn send(&self, msg: Arc<ServerMessage<O>>) -> Result<(), SendError>;
}

impl<O: Send + Sync> ClientSink<O> for mpsc::Sender<Arc<ServerMessage<O>>> {
    fn send(&self, msg: Arc<ServerMessage<O>>) -> Result<(), SendError> {
        self.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }
}

impl<O: Send + Sync> ClientSink<O> for mpsc::UnboundedSender<Arc<ServerMessage<O>>> {
    fn send(&self, msg: Arc<ServerMessage<O>>) -> Result<(), SendError> {
        mpsc::UnboundedSender::send(self, msg).map_err(|_| SendError::Closed)
    }
}

/// A member as the room sees it: identity plus push capability.
pub struct ClientHandle<O> {
    pub info: ClientInfo,
    sink: Arc<dyn ClientSink<O>>,
}

impl<O> Clone for ClientHandle<O> {
    fn clone(&self) -> Self {
        Self {
            info: self.info.clone(),
            sink: self.sink.clone(),
        }
    }
}

impl<O> ClientHandle<O> {
    pub fn new(info: ClientInfo, sink: Arc<dyn ClientSink<O>>) -> Self {
        Self { info, sink }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }
}

impl<O> std::fmt::Debug for ClientHandle<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle").field("info", &self.info).finish()
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

struct Peer<O> {
    handle: ClientHandle<O>,
    dropped: AtomicU64,
}

/// Membership and fan-out for one room.
pub struct BroadcastGroup<O> {
    peers: HashMap<ClientId, Peer<O>>,
    stats: AtomicBroadcastStats,
}

impl<O> Default for BroadcastGroup<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O> BroadcastGroup<O> {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a member. Returns the previous handle for the same id, if any.
    pub fn add_peer(&mut self, handle: ClientHandle<O>) -> Option<ClientHandle<O>> {
        let id = handle.info.id.clone();
        self.peers
            .insert(
                id,
                Peer {
                    handle,
                    dropped: AtomicU64::new(0),
                },
            )
            .map(|p| p.handle)
    }

    pub fn remove_peer(&mut self, id: &str) -> Option<ClientHandle<O>> {
        self.peers.remove(id).map(|p| p.handle)
    }

    pub fn get(&self, id: &str) -> Option<&ClientHandle<O>> {
        self.peers.get(id).map(|p| &p.handle)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Identities of every member, in no particular order.
    pub fn infos(&self) -> Vec<ClientInfo> {
        self.peers.values().map(|p| p.handle.info.clone()).collect()
    }

    /// Deliver to every member. Returns the number of successful pushes.
    pub fn broadcast_all(&self, msg: ServerMessage<O>) -> usize {
        self.fan_out(Arc::new(msg), None)
    }

    /// Deliver to every member except `excluded`.
    pub fn broadcast_except(&self, excluded: &str, msg: ServerMessage<O>) -> usize {
        self.fan_out(Arc::new(msg), Some(excluded))
    }

    /// Deliver to one member. Unknown ids count as nothing sent.
    pub fn send_to(&self, id: &str, msg: ServerMessage<O>) -> bool {
        match self.peers.get(id) {
            Some(peer) => self.deliver(id, peer, Arc::new(msg)),
            None => false,
        }
    }

    fn fan_out(&self, msg: Arc<ServerMessage<O>>, excluded: Option<&str>) -> usize {
        self.peers
            .iter()
            .filter(|(id, _)| Some(id.as_str()) != excluded)
            .filter(|(id, peer)| self.deliver(id, peer, msg.clone()))
            .count()
    }

    fn deliver(&self, id: &str, peer: &Peer<O>, msg: Arc<ServerMessage<O>>) -> bool {
        match peer.handle.sink.send(msg) {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                if peer.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                    log::warn!("Dropping messages for client {}: {}", id, e);
                } else {
                    log::trace!("Dropped message for client {}: {}", id, e);
                }
                false
            }
        }
    }

    /// Lock-free snapshot of delivery counters.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.len(),
        }
    }
}
