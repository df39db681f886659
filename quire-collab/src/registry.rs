//! Room lookup by id, with creation on first join and removal once empty.
//!
//! Lock order is always registry → room. The map lock is held only for
//! lookup, insert and remove; room operations run on a cloned `Arc<Room>`.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

use quire_core::Transform;

use crate::broadcast::ClientHandle;
use crate::room::{Room, RoomConfig, RoomError};

/// Health snapshot for introspection endpoints and periodic logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryStatus {
    pub status: &'static str,
    pub rooms: usize,
    pub clients: usize,
}

pub struct RoomRegistry<O> {
    rooms: RwLock<HashMap<String, Arc<Room<O>>>>,
    config: RoomConfig,
}

impl<O> RoomRegistry<O>
where
    O: Transform + Send + Sync + 'static,
{
    pub fn new(config: RoomConfig) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Get the room for `room_id`, creating an empty one if needed.
    pub async fn get_or_create(&self, room_id: &str) -> Arc<Room<O>> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }

        log::info!("Creating room {}", room_id);
        let room = Arc::new(Room::new(room_id, self.config));
        rooms.insert(room_id.to_string(), room.clone());
        room
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<Room<O>>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Join `room_id`, creating the room if needed.
    ///
    /// A room reaped between lookup and join refuses with
    /// [`RoomError::Closed`]; the lookup is then retried on a fresh room.
    pub async fn join(&self, room_id: &str, client: ClientHandle<O>) -> Result<Arc<Room<O>>, RoomError> {
        loop {
            let room = self.get_or_create(room_id).await;
            match room.join(client.clone()).await {
                Ok(()) => return Ok(room),
                Err(RoomError::Closed(_)) => {
                    log::debug!("Room {} closed during join, retrying", room_id);
                    // Closed rooms are already gone from the map, or about to be.
                    self.forget(room_id, &room).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Leave `room_id` and reap the room if that emptied it.
    /// Returns the remaining member count.
    pub async fn leave(&self, room_id: &str, client_id: &str) -> usize {
        let Some(room) = self.get(room_id).await else {
            return 0;
        };
        let remaining = room.leave(client_id).await;
        if remaining == 0 {
            self.reap_if_empty(room_id).await;
        }
        remaining
    }

    /// Remove the room if it has no members. Returns whether it was removed.
    pub async fn reap_if_empty(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(room_id).cloned() else {
            return false;
        };
        if room.close_if_empty().await {
            rooms.remove(room_id);
            log::info!("Removed empty room {}", room_id);
            true
        } else {
            false
        }
    }

    async fn forget(&self, room_id: &str, closed: &Arc<Room<O>>) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(room_id).is_some_and(|r| Arc::ptr_eq(r, closed)) {
            rooms.remove(room_id);
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    pub async fn status(&self) -> RegistryStatus {
        let rooms: Vec<Arc<Room<O>>> = self.rooms.read().await.values().cloned().collect();
        let mut clients = 0;
        for room in &rooms {
            clients += room.client_count().await;
        }
        RegistryStatus {
            status: "ok",
            rooms: rooms.len(),
            clients,
        }
    }
}

impl<O> Default for RoomRegistry<O>
where
    O: Transform + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(RoomConfig::default())
    }
}
