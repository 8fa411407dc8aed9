// Room registry: the per-process source of truth for who is in which room.
//
// The outer map is only held long enough to find or create a room; all
// membership changes happen under that room's own lock. A room that empties
// is marked retired under its lock before it is unlinked, so a concurrent
// join that raced the removal retries against a fresh entry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use axum::extract::ws::Utf8Bytes;
use marginalia_common::types::{PeerId, RoomId};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Process-unique identity of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Outcome of a non-blocking enqueue onto a connection's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queue at capacity; the frame was dropped.
    QueueFull,
    /// The connection's send loop is gone.
    Closed,
}

/// A registered client connection: who it is, where it is, and the bounded
/// queue its send loop drains.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer: PeerId,
    room: RoomId,
    outbound: mpsc::Sender<Utf8Bytes>,
}

impl Connection {
    /// Create a connection record and the receiving end of its outbound queue.
    pub fn open(
        peer: PeerId,
        room: RoomId,
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Utf8Bytes>) {
        let (outbound, receiver) = mpsc::channel(queue_capacity.max(1));
        (Arc::new(Self { id: ConnectionId::new(), peer, room, outbound }), receiver)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Enqueue without waiting. Full queues drop the newest frame.
    pub fn try_deliver(&self, frame: Utf8Bytes) -> Delivery {
        match self.outbound.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::QueueFull,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

#[derive(Debug, Default)]
struct Room {
    members: HashMap<ConnectionId, Arc<Connection>>,
    retired: bool,
}

#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, Arc<RwLock<Room>>>>,
}

impl RoomRegistry {
    /// Add a connection to its room, creating the room if needed.
    ///
    /// Returns the member snapshot right after insertion (including the
    /// joining connection).
    pub async fn join(&self, connection: Arc<Connection>) -> Vec<Arc<Connection>> {
        loop {
            let room = self.room_entry(connection.room()).await;
            let mut guard = room.write().await;
            if guard.retired {
                continue;
            }
            guard.members.insert(connection.id(), Arc::clone(&connection));
            return guard.members.values().cloned().collect();
        }
    }

    /// Remove a connection from its room, deleting the room once empty.
    ///
    /// Returns whether the connection was a member.
    pub async fn leave(&self, connection: &Connection) -> bool {
        let Some(room) = self.rooms.read().await.get(connection.room()).cloned() else {
            return false;
        };

        let mut guard = room.write().await;
        let removed = guard.members.remove(&connection.id()).is_some();
        if guard.members.is_empty() && !guard.retired {
            guard.retired = true;
            let mut rooms = self.rooms.write().await;
            if rooms.get(connection.room()).is_some_and(|current| Arc::ptr_eq(current, &room)) {
                rooms.remove(connection.room());
            }
        }
        removed
    }

    /// Point-in-time snapshot of a room's members. Empty when the room does
    /// not exist.
    pub async fn members(&self, room_id: &RoomId) -> Vec<Arc<Connection>> {
        let Some(room) = self.rooms.read().await.get(room_id).cloned() else {
            return Vec::new();
        };
        let guard = room.read().await;
        guard.members.values().cloned().collect()
    }

    pub async fn contains_room(&self, room_id: &RoomId) -> bool {
        self.rooms.read().await.contains_key(room_id)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn connection_count(&self) -> usize {
        let rooms: Vec<_> = self.rooms.read().await.values().cloned().collect();
        let mut total = 0;
        for room in rooms {
            total += room.read().await.members.len();
        }
        total
    }

    pub async fn is_empty(&self) -> bool {
        self.rooms.read().await.is_empty()
    }

    async fn room_entry(&self, room_id: &RoomId) -> Arc<RwLock<Room>> {
        if let Some(room) = self.rooms.read().await.get(room_id).cloned() {
            return room;
        }
        let mut rooms = self.rooms.write().await;
        Arc::clone(rooms.entry(room_id.clone()).or_default())
    }
}
