//! Session rooms held by the relay.
//!
//! A room exists only while at least one peer is connected. Its replica lets
//! a late joiner catch up with state the others already share; once the last
//! peer leaves the room is dropped and nothing survives on the relay.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use flowchart_core::SharedDocument;

use crate::broadcast::BroadcastGroup;
use crate::protocol::PeerInfo;

pub struct Room {
    pub replica: SharedDocument,
    pub broadcast: BroadcastGroup,
}

impl Room {
    pub fn new(broadcast_capacity: usize) -> Self {
        Self {
            replica: SharedDocument::new(),
            broadcast: BroadcastGroup::new(broadcast_capacity),
        }
    }
}

/// Maps session ids to rooms.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Add a peer to the room for `session`, creating the room if needed.
    ///
    /// The lookup and the join happen under the map's write lock, so a room
    /// is never dropped by [`remove_if_empty`](Self::remove_if_empty) between
    /// the two. Returns `None` when the room already holds `max_peers`.
    pub async fn join(
        &self,
        session: &str,
        info: PeerInfo,
        max_peers: usize,
    ) -> Option<(Arc<Room>, broadcast::Receiver<Arc<Vec<u8>>>)> {
        let mut rooms = self.rooms.write().await;
        let room = match rooms.get(session) {
            Some(room) => room.clone(),
            None => {
                if max_peers == 0 {
                    return None;
                }
                let room = Arc::new(Room::new(self.default_capacity));
                rooms.insert(session.to_string(), room.clone());
                room
            }
        };
        if room.broadcast.peer_count().await >= max_peers {
            return None;
        }
        let rx = room.broadcast.add_peer(info).await;
        Some((room, rx))
    }

    pub async fn get(&self, session: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(session).cloned()
    }

    /// Drop the room if nobody is left in it.
    pub async fn remove_if_empty(&self, session: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(session) {
            if room.broadcast.peer_count().await == 0 {
                rooms.remove(session);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_sessions(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
