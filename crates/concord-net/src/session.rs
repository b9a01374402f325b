//! Peer-side session handshake
//!
//! Drives `peer.init` over a freshly attached connection, takes in the
//! `peer.onInfo` descriptor (assigned id, room roster, server identity),
//! keeps the roster in sync with `room.*` notifications, and releases the
//! ready barrier. Obtaining the join token and opening the transport are
//! the front-end's job; this module starts where the transport exists.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use concord_crypto::KeyPair;
use concord_protocol::handshake::{methods, CloseInfo, InitInfo, InitParams, LeaveInfo, PeerInfo};
use concord_protocol::version::PROTOCOL_VERSION;
use concord_protocol::PeerId;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info};

use crate::connection::Connection;
use crate::error::ConnectionError;
use crate::transport::Transport;
use crate::Result;

/// Deadline for the server's `peer.onInfo` after `peer.init` succeeds
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Room membership changes observed by this session
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// A peer was admitted to the room
    Joined(PeerInfo),
    /// A guest left the room
    Left(PeerId),
    /// The room was torn down
    Closed(String),
}

/// One peer's connected session with a room
pub struct PeerSession {
    connection: Connection,
    info: InitInfo,
    events_tx: broadcast::Sender<RoomEvent>,
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl PeerSession {
    /// Run the handshake over `transport` and return the live session
    pub async fn connect(keypair: KeyPair, transport: Transport) -> Result<Self> {
        Self::connect_with_timeout(keypair, transport, HANDSHAKE_TIMEOUT).await
    }

    /// Handshake with a custom `peer.onInfo` deadline
    pub async fn connect_with_timeout(
        keypair: KeyPair,
        transport: Transport,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let connection = Connection::attach(keypair, transport);
        let identity = connection.public_identity();
        let (events_tx, _) = broadcast::channel(32);

        let (info_tx, info_rx) = oneshot::channel::<InitInfo>();
        let info_tx = Arc::new(Mutex::new(Some(info_tx)));
        connection.on_notification(methods::PEER_ON_INFO, {
            let info_tx = Arc::clone(&info_tx);
            move |_origin, info: InitInfo| {
                let info_tx = Arc::clone(&info_tx);
                async move {
                    if let Some(tx) = info_tx.lock().unwrap().take() {
                        let _ = tx.send(info);
                    }
                }
            }
        });

        install_room_handlers(&connection, &events_tx);
        connection.start();

        connection
            .send_clear_request::<_, ()>(
                methods::PEER_INIT,
                &InitParams {
                    protocol: PROTOCOL_VERSION.to_string(),
                    identity,
                },
            )
            .await
            .map_err(|e| match e {
                ConnectionError::Remote(message) => ConnectionError::Handshake(message),
                other => other,
            })?;

        let info = tokio::time::timeout(handshake_timeout, info_rx)
            .await
            .map_err(|_| ConnectionError::Handshake("timed out waiting for peer.onInfo".into()))?
            .map_err(|_| ConnectionError::Disconnected)?;

        connection.set_local_id(info.peer.id.clone());
        connection.set_server_identity(info.server.clone());
        for peer in &info.roster {
            connection.add_peer(peer.id.clone(), peer.identity.clone());
        }
        connection.mark_ready();

        info!(
            peer = %info.peer.id,
            room = %info.room_id,
            host = info.peer.host,
            "joined room"
        );

        Ok(Self {
            connection,
            info,
            events_tx,
        })
    }

    /// The underlying connection for registering handlers and sending
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Our server-assigned peer id
    pub fn peer_id(&self) -> &PeerId {
        &self.info.peer.id
    }

    /// The room we are attached to
    pub fn room_id(&self) -> &str {
        &self.info.room_id
    }

    /// Whether we host the room
    pub fn is_host(&self) -> bool {
        self.info.peer.host
    }

    /// The roster as of admission, excluding ourselves
    pub fn initial_roster(&self) -> &[PeerInfo] {
        &self.info.roster
    }

    /// Subscribe to room membership events
    pub fn subscribe_events(&self) -> broadcast::Receiver<RoomEvent> {
        self.events_tx.subscribe()
    }
}

fn install_room_handlers(connection: &Connection, events_tx: &broadcast::Sender<RoomEvent>) {
    connection.on_notification(methods::ROOM_ON_JOIN, {
        let connection = connection.clone();
        let events = events_tx.clone();
        move |_origin, peer: PeerInfo| {
            let connection = connection.clone();
            let events = events.clone();
            async move {
                debug!(peer = %peer.id, "peer joined room");
                connection.add_peer(peer.id.clone(), peer.identity.clone());
                let _ = events.send(RoomEvent::Joined(peer));
            }
        }
    });

    connection.on_notification(methods::ROOM_ON_LEAVE, {
        let connection = connection.clone();
        let events = events_tx.clone();
        move |_origin, leave: LeaveInfo| {
            let connection = connection.clone();
            let events = events.clone();
            async move {
                debug!(peer = %leave.peer, "peer left room");
                connection.remove_peer(&leave.peer);
                let _ = events.send(RoomEvent::Left(leave.peer));
            }
        }
    });

    connection.on_notification(methods::ROOM_ON_CLOSE, {
        let connection = connection.clone();
        let events = events_tx.clone();
        move |_origin, close: CloseInfo| {
            let connection = connection.clone();
            let events = events.clone();
            async move {
                debug!(reason = %close.reason, "room closed");
                let _ = events.send(RoomEvent::Closed(close.reason));
                connection.dispose();
            }
        }
    });
}
