//! Typed payloads for the admission handshake and room lifecycle
//!
//! These travel as postcard-encoded [`Content`](crate::Content) payloads
//! under the well-known method names below.

use concord_crypto::PublicIdentity;
use serde::{Deserialize, Serialize};

use crate::envelope::PeerId;

/// Well-known method names
pub mod methods {
    /// Client → server: version check and identity announcement
    pub const PEER_INIT: &str = "peer.init";
    /// Server → client: assigned id, roster, server identity
    pub const PEER_ON_INFO: &str = "peer.onInfo";
    /// Server → host: approval request for a joining candidate
    pub const PEER_ON_JOIN_REQUEST: &str = "peer.onJoinRequest";
    /// Server → room members: a peer was admitted
    pub const ROOM_ON_JOIN: &str = "room.onJoin";
    /// Server → room members: a guest left
    pub const ROOM_ON_LEAVE: &str = "room.onLeave";
    /// Server → guests: the room is being torn down
    pub const ROOM_ON_CLOSE: &str = "room.onClose";
}

/// `peer.init` request parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitParams {
    /// Protocol version the client speaks
    pub protocol: String,
    /// The client's public identity
    pub identity: PublicIdentity,
}

/// One roster entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Server-assigned peer id
    pub id: PeerId,
    /// Display name
    pub name: String,
    /// Optional email
    pub email: Option<String>,
    /// Public identity other members seal to
    pub identity: PublicIdentity,
    /// Whether this peer hosts the room
    pub host: bool,
}

/// `peer.onInfo` notification payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitInfo {
    /// The receiving peer's own entry
    pub peer: PeerInfo,
    /// Room the peer was attached to
    pub room_id: String,
    /// The server's public identity
    pub server: PublicIdentity,
    /// Current members, excluding the receiver
    pub roster: Vec<PeerInfo>,
}

/// `peer.onJoinRequest` parameters sent to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequestParams {
    /// Candidate display name
    pub name: String,
    /// Candidate email, if the login carried one
    pub email: Option<String>,
}

/// Host's answer to `peer.onJoinRequest`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinDecision {
    /// Whether the candidate may join
    pub accept: bool,
    /// Workspace descriptor, present on acceptance
    pub workspace: Option<Workspace>,
}

/// What the host shares with an admitted guest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    /// Workspace display name
    pub name: String,
    /// Shared folder names
    pub folders: Vec<String>,
}

/// `room.onLeave` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveInfo {
    /// The peer that left
    pub peer: PeerId,
}

/// `room.onClose` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseInfo {
    /// Human-readable reason
    pub reason: String,
}
