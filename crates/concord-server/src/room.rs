//! Room catalogue and membership
//!
//! A room exists exactly as long as its host's connection does. The
//! manager keeps membership consistent under concurrent joins and leaves;
//! fanning out notifications and closing connections is the caller's job,
//! so no lock is ever held across an await.

use std::sync::Arc;
use std::time::Instant;

use concord_protocol::PeerId;
use dashmap::DashMap;

use crate::error::ServerError;
use crate::peer::Peer;
use crate::Result;

/// What room members other than the host are allowed to do
#[derive(Debug, Clone, Copy)]
pub struct RoomPermissions {
    /// Whether guests may fan messages out to the whole room
    pub guests_may_broadcast: bool,
}

impl Default for RoomPermissions {
    fn default() -> Self {
        Self {
            guests_may_broadcast: true,
        }
    }
}

/// A collaboration room: one host, any number of guests
#[derive(Debug)]
pub struct Room {
    /// Opaque room id
    pub id: String,
    /// The owning peer; its connection's lifetime bounds the room's
    pub host: Arc<Peer>,
    /// Admitted guests
    pub guests: Vec<Arc<Peer>>,
    /// When the room was opened
    pub created_at: Instant,
    /// Member permissions, fixed at room creation
    pub permissions: RoomPermissions,
}

impl Room {
    fn new(id: String, host: Arc<Peer>, permissions: RoomPermissions) -> Self {
        Self {
            id,
            host,
            guests: Vec::new(),
            created_at: Instant::now(),
            permissions,
        }
    }

    /// All members, host first
    pub fn members(&self) -> Vec<Arc<Peer>> {
        let mut members = Vec::with_capacity(1 + self.guests.len());
        members.push(Arc::clone(&self.host));
        members.extend(self.guests.iter().cloned());
        members
    }

    /// Look a member up by peer id
    pub fn member(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.members().into_iter().find(|p| &p.id == id)
    }
}

/// What happened when a peer left
#[derive(Debug)]
pub enum LeaveOutcome {
    /// The host left; the room is gone and its guests need closing
    HostLost(Room),
    /// A guest left; the remainder should hear about it
    GuestLeft {
        /// Room the guest left
        room_id: String,
        /// The departed guest
        peer: PeerId,
        /// Members still in the room
        remaining: Vec<Arc<Peer>>,
    },
}

/// Catalogue of open rooms
pub struct RoomManager {
    rooms: DashMap<String, Room>,
    peer_rooms: DashMap<PeerId, String>,
    max_rooms: usize,
}

impl RoomManager {
    /// Create a manager capped at `max_rooms` concurrent rooms
    pub fn new(max_rooms: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            peer_rooms: DashMap::new(),
            max_rooms,
        }
    }

    /// Open a room with its host
    pub fn open_room(
        &self,
        room_id: &str,
        host: Arc<Peer>,
        permissions: RoomPermissions,
    ) -> Result<()> {
        if self.peer_rooms.contains_key(&host.id) {
            return Err(ServerError::AlreadyInRoom(host.id.clone()));
        }
        // Capacity check happens before the entry lock: DashMap's len()
        // read-locks all shards and would deadlock inside entry().
        if self.rooms.len() >= self.max_rooms && !self.rooms.contains_key(room_id) {
            return Err(ServerError::AtCapacity);
        }

        use dashmap::mapref::entry::Entry;
        match self.rooms.entry(room_id.to_string()) {
            Entry::Occupied(_) => Err(ServerError::RoomExists(room_id.to_string())),
            Entry::Vacant(entry) => {
                let host_id = host.id.clone();
                entry.insert(Room::new(room_id.to_string(), host, permissions));
                self.peer_rooms.insert(host_id, room_id.to_string());
                Ok(())
            }
        }
    }

    /// Whether a room is currently open
    pub fn exists(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// A room's permission set
    pub fn permissions(&self, room_id: &str) -> Option<RoomPermissions> {
        self.rooms.get(room_id).map(|r| r.permissions)
    }

    /// The host of a room
    pub fn host_of(&self, room_id: &str) -> Option<Arc<Peer>> {
        self.rooms.get(room_id).map(|r| Arc::clone(&r.host))
    }

    /// All members of a room, host first
    pub fn members(&self, room_id: &str) -> Vec<Arc<Peer>> {
        self.rooms
            .get(room_id)
            .map(|r| r.members())
            .unwrap_or_default()
    }

    /// One member of a room by peer id
    pub fn member(&self, room_id: &str, peer_id: &PeerId) -> Option<Arc<Peer>> {
        self.rooms.get(room_id).and_then(|r| r.member(peer_id))
    }

    /// The room a peer currently belongs to
    pub fn room_of(&self, peer_id: &PeerId) -> Option<String> {
        self.peer_rooms.get(peer_id).map(|r| r.clone())
    }

    /// Add a guest to a room; returns the members that were already in it
    pub fn admit(&self, room_id: &str, guest: Arc<Peer>) -> Result<Vec<Arc<Peer>>> {
        if self.peer_rooms.contains_key(&guest.id) {
            return Err(ServerError::AlreadyInRoom(guest.id.clone()));
        }
        let existing = {
            let mut room = self
                .rooms
                .get_mut(room_id)
                .ok_or_else(|| ServerError::UnknownRoom(room_id.to_string()))?;
            let existing = room.members();
            room.guests.push(Arc::clone(&guest));
            existing
        };
        self.peer_rooms.insert(guest.id.clone(), room_id.to_string());
        Ok(existing)
    }

    /// Remove a peer from its room
    ///
    /// Host departure removes the whole room and unindexes every member.
    pub fn leave(&self, peer_id: &PeerId) -> Option<LeaveOutcome> {
        let (_, room_id) = self.peer_rooms.remove(peer_id)?;

        let is_host = self
            .rooms
            .get(&room_id)
            .map(|r| &r.host.id == peer_id)
            .unwrap_or(false);

        if is_host {
            let (_, room) = self.rooms.remove(&room_id)?;
            for guest in &room.guests {
                self.peer_rooms.remove(&guest.id);
            }
            Some(LeaveOutcome::HostLost(room))
        } else {
            let remaining = {
                let mut room = self.rooms.get_mut(&room_id)?;
                room.guests.retain(|g| &g.id != peer_id);
                room.members()
            };
            Some(LeaveOutcome::GuestLeft {
                room_id,
                peer: peer_id.clone(),
                remaining,
            })
        }
    }

    /// Remove a room outright, unindexing all members
    pub fn close_room(&self, room_id: &str) -> Option<Room> {
        let (_, room) = self.rooms.remove(room_id)?;
        self.peer_rooms.remove(&room.host.id);
        for guest in &room.guests {
            self.peer_rooms.remove(&guest.id);
        }
        Some(room)
    }

    /// Number of open rooms
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
