//! Message relay
//!
//! Installed as the [`Router`] on every peer connection once its handshake
//! completes. Each inbound envelope gets its origin stamped with the
//! authenticated peer id (the wire value is never trusted), then routes:
//! server-addressed envelopes dispatch locally, peer-addressed ones are
//! forwarded verbatim within the room, broadcasts fan out to the rest of
//! the room. The relay holds no recipient keys and no per-request state;
//! the ciphertext and the envelope header are all it ever reads.

use std::sync::Arc;

use concord_net::{Connection, Router};
use concord_protocol::{Envelope, PeerId, Target};
use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::room::RoomManager;

/// Per-peer relay hook
pub struct PeerRouter {
    rooms: Arc<RoomManager>,
    peer_id: PeerId,
    room_id: String,
    /// The origin peer's own connection, for error reports back to it
    connection: Connection,
}

impl PeerRouter {
    /// Build the router for one admitted peer
    pub fn new(
        rooms: Arc<RoomManager>,
        peer_id: PeerId,
        room_id: String,
        connection: Connection,
    ) -> Self {
        Self {
            rooms,
            peer_id,
            room_id,
            connection,
        }
    }
}

enum Route {
    Local,
    Unicast(PeerId),
    Fanout,
}

impl Router for PeerRouter {
    fn route(&self, mut envelope: Envelope) -> BoxFuture<'static, Option<Envelope>> {
        let rooms = Arc::clone(&self.rooms);
        let peer_id = self.peer_id.clone();
        let room_id = self.room_id.clone();
        let connection = self.connection.clone();

        Box::pin(async move {
            // The origin on the wire is whatever the client claims;
            // overwrite it with the authenticated peer id.
            envelope.set_origin(peer_id.clone());

            let route = match (&envelope, envelope.target()) {
                // Error reports without a target are for the server
                (Envelope::Error { .. }, _) => Route::Local,
                (_, Some(Target::Server)) => Route::Local,
                (_, Some(Target::Peer(id))) => Route::Unicast(id.clone()),
                (_, Some(Target::All)) | (Envelope::Broadcast { .. }, _) => Route::Fanout,
                _ => Route::Local,
            };

            match route {
                Route::Local => Some(envelope),
                Route::Unicast(target_id) => {
                    match rooms.member(&room_id, &target_id) {
                        Some(peer) => {
                            if let Err(e) = peer.connection.forward(envelope).await {
                                debug!(
                                    from = %peer_id,
                                    to = %target_id,
                                    "dropping relayed envelope: {e}"
                                );
                            }
                        }
                        None => {
                            warn!(
                                from = %peer_id,
                                to = %target_id,
                                "no such recipient in room"
                            );
                            if let Err(e) = connection
                                .send_error(Target::Peer(peer_id.clone()), "no such recipient")
                                .await
                            {
                                debug!("could not report routing error: {e}");
                            }
                        }
                    }
                    None
                }
                Route::Fanout => {
                    let allowed = rooms
                        .permissions(&room_id)
                        .map(|p| p.guests_may_broadcast)
                        .unwrap_or(true)
                        || rooms
                            .host_of(&room_id)
                            .map(|h| h.id == peer_id)
                            .unwrap_or(false);
                    if !allowed {
                        debug!(from = %peer_id, "dropping broadcast: restricted to the host");
                        if let Err(e) = connection
                            .send_error(
                                Target::Peer(peer_id.clone()),
                                "broadcasts are restricted to the host",
                            )
                            .await
                        {
                            debug!("could not report routing error: {e}");
                        }
                        return None;
                    }
                    for peer in rooms.members(&room_id) {
                        if peer.id == peer_id {
                            continue;
                        }
                        if let Err(e) = peer.connection.forward(envelope.clone()).await {
                            debug!(
                                from = %peer_id,
                                to = %peer.id,
                                "dropping fanned-out envelope: {e}"
                            );
                        }
                    }
                    None
                }
            }
        })
    }
}
