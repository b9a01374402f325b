//! Server-side peer handles

use concord_crypto::PublicIdentity;
use concord_net::Connection;
use concord_protocol::handshake::PeerInfo;
use concord_protocol::PeerId;
use rand::RngCore;

/// One connected client, as the server sees it
#[derive(Debug)]
pub struct Peer {
    /// Server-assigned id, unique per connection
    pub id: PeerId,
    /// Display name from the user record
    pub name: String,
    /// Optional email from the user record
    pub email: Option<String>,
    /// Identity other members seal to
    pub identity: PublicIdentity,
    /// Whether this peer hosts its room
    pub host: bool,
    /// The room this peer belongs to
    pub room_id: String,
    /// The server-side connection core for this peer's transport
    pub connection: Connection,
}

impl Peer {
    /// Roster entry for this peer
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            email: self.email.clone(),
            identity: self.identity.clone(),
            host: self.host,
        }
    }
}

/// Allocate a fresh opaque peer id
pub fn new_peer_id() -> PeerId {
    let mut raw = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    PeerId(hex::encode(raw))
}
