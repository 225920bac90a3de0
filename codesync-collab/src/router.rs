//! Room router: who receives what.
//!
//! Two indices over live connections, kept consistent on every
//! register/unregister:
//! ```text
//! FileKey ──► {ConnectionId}     one entry per open file per connection
//! token   ──► {ConnectionId}     at most one room per connection
//! ```
//!
//! Every connection owns a bounded outbox (a tokio broadcast channel with a
//! single subscriber). Sending never blocks; a peer that falls more than
//! `capacity` frames behind loses the oldest ones. A failed send is logged
//! and never stops delivery to the remaining recipients.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::TransportError;
use crate::files::FileKey;
use crate::protocol::{ProtocolError, ServerMessage};

pub type ConnectionId = Uuid;

/// An encoded text frame, shared by every recipient of a broadcast.
pub type Frame = Arc<str>;

/// A broadcast audience.
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    /// Everyone viewing a file.
    File(&'a FileKey),
    /// Everyone joined to a room.
    Room(&'a str),
}

/// Router statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub connections: usize,
    pub rooms: usize,
    pub open_files: usize,
    pub frames_sent: u64,
    pub frames_failed: u64,
}

/// What a connection left behind when it was unregistered.
#[derive(Debug, Clone, Default)]
pub struct Departure {
    pub room: Option<String>,
    /// Files that no connection views any more.
    pub orphaned_files: Vec<FileKey>,
}

struct ConnectionEntry {
    outbox: broadcast::Sender<Frame>,
    room: Option<String>,
    files: HashSet<FileKey>,
}

/// Connection, file and room indices shared by every connection task.
pub struct RoomRouter {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    files: DashMap<FileKey, HashSet<ConnectionId>>,
    rooms: DashMap<String, HashSet<ConnectionId>>,
    /// Frames buffered per connection before the oldest are dropped.
    capacity: usize,
    frames_sent: AtomicU64,
    frames_failed: AtomicU64,
}

impl RoomRouter {
    pub fn new(capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            files: DashMap::new(),
            rooms: DashMap::new(),
            capacity: capacity.max(1),
            frames_sent: AtomicU64::new(0),
            frames_failed: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Register a connection and return the receiving end of its outbox.
    pub fn register(&self, id: ConnectionId) -> broadcast::Receiver<Frame> {
        let (outbox, rx) = broadcast::channel(self.capacity);
        self.connections.insert(
            id,
            ConnectionEntry {
                outbox,
                room: None,
                files: HashSet::new(),
            },
        );
        rx
    }

    /// Remove a connection from every index.
    pub fn unregister(&self, id: ConnectionId) -> Option<Departure> {
        let (_, entry) = self.connections.remove(&id)?;

        let mut departure = Departure {
            room: entry.room.clone(),
            orphaned_files: Vec::new(),
        };
        for key in entry.files {
            if self.remove_viewer(&key, id) {
                departure.orphaned_files.push(key);
            }
        }
        if let Some(token) = &entry.room {
            self.remove_member(token, id);
        }
        Some(departure)
    }

    pub fn is_registered(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Put a connection into a room, leaving its previous one.
    pub fn join_room(&self, id: ConnectionId, token: &str) -> bool {
        let previous = {
            let Some(mut entry) = self.connections.get_mut(&id) else {
                return false;
            };
            entry.room.replace(token.to_string())
        };
        if let Some(previous) = previous.filter(|p| p != token) {
            self.remove_member(&previous, id);
        }
        self.rooms.entry(token.to_string()).or_default().insert(id);
        true
    }

    pub fn leave_room(&self, id: ConnectionId) -> Option<String> {
        let token = self.connections.get_mut(&id)?.room.take()?;
        self.remove_member(&token, id);
        Some(token)
    }

    /// Add a connection to a file's viewers.
    pub fn open_file(&self, id: ConnectionId, key: &FileKey) -> bool {
        {
            let Some(mut entry) = self.connections.get_mut(&id) else {
                return false;
            };
            entry.files.insert(key.clone());
        }
        self.files.entry(key.clone()).or_default().insert(id);
        true
    }

    /// Remove a connection from a file's viewers. Returns true if nobody
    /// views the file any more.
    pub fn close_file(&self, id: ConnectionId, key: &FileKey) -> bool {
        if let Some(mut entry) = self.connections.get_mut(&id) {
            entry.files.remove(key);
        }
        self.remove_viewer(key, id)
    }

    pub fn file_subscribers(&self, key: &FileKey) -> Vec<ConnectionId> {
        self.files
            .get(key)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn room_members(&self, token: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(token)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Send one message to one connection.
    pub fn send_to(&self, id: ConnectionId, msg: &ServerMessage) -> Result<(), crate::CollabError> {
        let frame: Frame = msg.encode()?.into();
        self.send_frame(id, frame)?;
        Ok(())
    }

    /// Queue an encoded frame on a connection's outbox.
    pub fn send_frame(&self, id: ConnectionId, frame: Frame) -> Result<(), TransportError> {
        let entry = self
            .connections
            .get(&id)
            .ok_or(TransportError::UnknownConnection(id))?;
        match entry.outbox.send(frame) {
            Ok(_) => {
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(_) => {
                self.frames_failed.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::RecipientGone(id))
            }
        }
    }

    /// Send `msg` to the union of `targets`, once per connection, skipping
    /// `exclude`. Returns how many connections it was queued for.
    pub fn broadcast(
        &self,
        targets: &[Target<'_>],
        msg: &ServerMessage,
        exclude: Option<ConnectionId>,
    ) -> Result<usize, ProtocolError> {
        let mut recipients: HashSet<ConnectionId> = HashSet::new();
        for target in targets {
            match target {
                Target::File(key) => {
                    if let Some(set) = self.files.get(*key) {
                        recipients.extend(set.iter().copied());
                    }
                }
                Target::Room(token) => {
                    if let Some(set) = self.rooms.get(*token) {
                        recipients.extend(set.iter().copied());
                    }
                }
            }
        }
        if let Some(id) = exclude {
            recipients.remove(&id);
        }
        if recipients.is_empty() {
            return Ok(0);
        }

        let frame: Frame = msg.encode()?.into();
        let mut delivered = 0;
        for id in recipients {
            match self.send_frame(id, Arc::clone(&frame)) {
                Ok(()) => delivered += 1,
                Err(e) => log::warn!("Dropping '{}' frame: {e}", msg.kind()),
            }
        }
        log::trace!("Broadcast '{}' to {delivered} connection(s)", msg.kind());
        Ok(delivered)
    }

    pub fn broadcast_file(
        &self,
        key: &FileKey,
        msg: &ServerMessage,
        exclude: Option<ConnectionId>,
    ) -> Result<usize, ProtocolError> {
        self.broadcast(&[Target::File(key)], msg, exclude)
    }

    pub fn broadcast_room(
        &self,
        token: &str,
        msg: &ServerMessage,
        exclude: Option<ConnectionId>,
    ) -> Result<usize, ProtocolError> {
        self.broadcast(&[Target::Room(token)], msg, exclude)
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            connections: self.connections.len(),
            rooms: self.rooms.len(),
            open_files: self.files.len(),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_failed: self.frames_failed.load(Ordering::Relaxed),
        }
    }

    fn remove_viewer(&self, key: &FileKey, id: ConnectionId) -> bool {
        if let Some(mut set) = self.files.get_mut(key) {
            set.remove(&id);
        }
        self.files.remove_if(key, |_, set| set.is_empty()).is_some()
            || !self.files.contains_key(key)
    }

    fn remove_member(&self, token: &str, id: ConnectionId) {
        if let Some(mut set) = self.rooms.get_mut(token) {
            set.remove(&id);
        }
        self.rooms.remove_if(token, |_, set| set.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    fn recv_kinds(rx: &mut broadcast::Receiver<Frame>) -> Vec<String> {
        let mut kinds = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            let msg = ServerMessage::decode(&frame).unwrap();
            kinds.push(msg.kind().to_string());
        }
        kinds
    }

    #[test]
    fn test_room_broadcast_excludes_sender() {
        let router = RoomRouter::new(16);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut rx_a = router.register(a);
        let mut rx_b = router.register(b);
        router.join_room(a, "t1");
        router.join_room(b, "t1");

        let sent = router
            .broadcast_room("t1", &ServerMessage::error("hi"), Some(a))
            .unwrap();
        assert_eq!(sent, 1);
        assert_eq!(rx_a.try_recv().unwrap_err(), TryRecvError::Empty);
        assert_eq!(recv_kinds(&mut rx_b), vec!["error"]);
    }

    #[test]
    fn test_rooms_are_isolated() {
        let router = RoomRouter::new(16);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let _rx_a = router.register(a);
        let mut rx_b = router.register(b);
        router.join_room(a, "room-a");
        router.join_room(b, "room-b");
        let key_a = FileKey::in_room("room-a", "main.rs");
        router.open_file(a, &key_a);

        let msg = ServerMessage::Update {
            file_id: "main.rs".into(),
            content: "x".into(),
            revision: 0,
        };
        router
            .broadcast(&[Target::File(&key_a), Target::Room("room-a")], &msg, Some(a))
            .unwrap();
        assert!(recv_kinds(&mut rx_b).is_empty());
    }

    #[test]
    fn test_union_delivers_once() {
        let router = RoomRouter::new(16);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let _rx_a = router.register(a);
        let mut rx_b = router.register(b);
        let key = FileKey::in_room("t", "f");
        for id in [a, b] {
            router.join_room(id, "t");
            router.open_file(id, &key);
        }

        let sent = router
            .broadcast(&[Target::File(&key), Target::Room("t")], &ServerMessage::error("x"), Some(a))
            .unwrap();
        assert_eq!(sent, 1);
        assert_eq!(recv_kinds(&mut rx_b).len(), 1);
    }

    #[test]
    fn test_dead_recipient_does_not_block_others() {
        let router = RoomRouter::new(16);
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let _rx_a = router.register(a);
        let rx_b = router.register(b);
        let mut rx_c = router.register(c);
        for id in [a, b, c] {
            router.join_room(id, "t");
        }
        drop(rx_b);

        let sent = router
            .broadcast_room("t", &ServerMessage::error("x"), Some(a))
            .unwrap();
        assert_eq!(sent, 1);
        assert_eq!(recv_kinds(&mut rx_c).len(), 1);
        assert_eq!(router.stats().frames_failed, 1);
    }

    #[test]
    fn test_slow_peer_loses_oldest_frames() {
        let router = RoomRouter::new(2);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let _rx_a = router.register(a);
        let mut rx_b = router.register(b);
        router.join_room(a, "t");
        router.join_room(b, "t");

        for i in 0..5 {
            router
                .broadcast_room("t", &ServerMessage::error(format!("m{i}")), Some(a))
                .unwrap();
        }
        assert!(matches!(rx_b.try_recv(), Err(TryRecvError::Lagged(3))));
        let last: Vec<_> = std::iter::from_fn(|| rx_b.try_recv().ok())
            .map(|f| ServerMessage::decode(&f).unwrap())
            .collect();
        assert_eq!(last, vec![ServerMessage::error("m3"), ServerMessage::error("m4")]);
    }

    #[test]
    fn test_unregister_reports_orphans() {
        let router = RoomRouter::new(4);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let _rx_a = router.register(a);
        let _rx_b = router.register(b);
        let shared = FileKey::in_room("t", "shared.rs");
        let private = FileKey::in_room("t", "private.rs");
        router.join_room(a, "t");
        router.join_room(b, "t");
        router.open_file(a, &shared);
        router.open_file(b, &shared);
        router.open_file(a, &private);

        let departure = router.unregister(a).unwrap();
        assert_eq!(departure.room.as_deref(), Some("t"));
        assert_eq!(departure.orphaned_files, vec![private]);
        assert_eq!(router.file_subscribers(&shared), vec![b]);
        assert_eq!(router.room_members("t"), vec![b]);
        assert!(router.unregister(a).is_none());

        router.unregister(b);
        let stats = router.stats();
        assert_eq!((stats.connections, stats.rooms, stats.open_files), (0, 0, 0));
    }

    #[test]
    fn test_close_file_and_leave_room() {
        let router = RoomRouter::new(4);
        let a = Uuid::new_v4();
        let _rx = router.register(a);
        let key = FileKey::solo("x");
        router.open_file(a, &key);
        assert!(router.close_file(a, &key));
        assert!(router.file_subscribers(&key).is_empty());

        router.join_room(a, "t");
        assert_eq!(router.leave_room(a).as_deref(), Some("t"));
        assert!(router.room_members("t").is_empty());
        assert_eq!(router.leave_room(a), None);
    }

    #[test]
    fn test_unknown_connection() {
        let router = RoomRouter::new(4);
        let ghost = Uuid::new_v4();
        assert!(!router.join_room(ghost, "t"));
        assert!(!router.open_file(ghost, &FileKey::solo("x")));
        assert!(matches!(
            router.send_frame(ghost, Arc::from("{}")),
            Err(TransportError::UnknownConnection(_))
        ));
    }
}
