//! The collaboration server orchestrator
//!
//! [`ServerContext`] owns the singletons (config, key pair, room /
//! credentials / user managers) and drives the admission handshake for
//! every new transport: redeem claim, `peer.init`, peer creation,
//! `peer.onInfo`, room attach, relay install, ready.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use concord_crypto::KeyPair;
use concord_net::{Connection, ConnectionError, Transport};
use concord_protocol::handshake::{
    methods, CloseInfo, InitInfo, InitParams, JoinDecision, JoinRequestParams, LeaveInfo,
    Workspace,
};
use concord_protocol::{version, PeerId, Target};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::credentials::{CredentialsManager, JoinClaim};
use crate::error::ServerError;
use crate::peer::{new_peer_id, Peer};
use crate::relay::PeerRouter;
use crate::room::{LeaveOutcome, Room, RoomManager, RoomPermissions};
use crate::users::{User, UserManager};
use crate::Result;

/// Root of the server's object graph
pub struct ServerContext {
    /// Validated configuration
    pub config: ServerConfig,
    /// The server's own identity key pair
    pub keypair: KeyPair,
    /// Room catalogue
    pub rooms: Arc<RoomManager>,
    /// Token mint
    pub credentials: Arc<CredentialsManager>,
    /// User registry
    pub users: Arc<UserManager>,
}

impl ServerContext {
    /// Build the context from a validated configuration
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let credentials = Arc::new(CredentialsManager::new(
            Duration::from_secs(config.login_token_ttl_secs),
            Duration::from_secs(config.join_token_ttl_secs),
        ));
        Arc::new(Self {
            keypair: KeyPair::generate(),
            rooms: Arc::new(RoomManager::new(config.max_rooms)),
            credentials,
            users: Arc::new(UserManager::new()),
            config,
        })
    }

    /// Start the token sweeper
    pub fn start_background_tasks(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.credentials
            .spawn_sweeper(Duration::from_secs(self.config.token_sweep_interval_secs))
    }

    /// Run the host-approval workflow for a join candidate
    ///
    /// Sends `peer.onJoinRequest` to the room's host and waits for the
    /// decision. Approval mints the join token; denial and timeout map to
    /// 403 and 408 on the HTTP surface.
    pub async fn join_request(&self, room_id: &str, candidate: &User) -> Result<(String, Workspace)> {
        let host = self
            .rooms
            .host_of(room_id)
            .ok_or_else(|| ServerError::UnknownRoom(room_id.to_string()))?;

        let params = JoinRequestParams {
            name: candidate.name.clone(),
            email: candidate.email.clone(),
        };
        let deadline = Duration::from_secs(self.config.join_approval_timeout_secs);
        let decision: JoinDecision = host
            .connection
            .send_request_with_timeout(
                methods::PEER_ON_JOIN_REQUEST,
                Target::Peer(host.id.clone()),
                &params,
                deadline,
            )
            .await
            .map_err(|e| match e {
                ConnectionError::Timeout => ServerError::ApprovalTimeout,
                ConnectionError::Remote(_) => ServerError::Denied,
                other => ServerError::Connection(other),
            })?;

        if !decision.accept {
            info!(room = room_id, user = %candidate.id, "join denied by host");
            return Err(ServerError::Denied);
        }

        let workspace = decision.workspace.unwrap_or_else(|| Workspace {
            name: room_id.to_string(),
            folders: Vec::new(),
        });
        let token = self
            .credentials
            .mint_join_token(&candidate.id, room_id, false);
        info!(room = room_id, user = %candidate.id, "join approved by host");
        Ok((token, workspace))
    }

    /// Run the admission handshake on a fresh transport
    ///
    /// The join claim has already been redeemed (single-use) by the HTTP
    /// layer. On success the peer is attached to its room, the relay is
    /// installed, and the connection is ready.
    pub async fn attach_transport(
        self: Arc<Self>,
        transport: Transport,
        claim: JoinClaim,
    ) -> Result<Arc<Peer>> {
        let user = self
            .users
            .get(&claim.user_id)
            .ok_or(ServerError::UnknownUser)?;

        let connection = Connection::attach(self.keypair.clone(), transport);
        let mut disconnects = connection.subscribe_disconnect();

        // peer.init: version check and proof that the connecting client
        // holds the identity it logged in with.
        let (init_tx, init_rx) = oneshot::channel::<InitParams>();
        let init_tx = Arc::new(Mutex::new(Some(init_tx)));
        let expected_identity = user.identity.clone();
        connection.on_request(methods::PEER_INIT, move |_origin, params: InitParams| {
            let init_tx = Arc::clone(&init_tx);
            let expected = expected_identity.clone();
            async move {
                version::check(&params.protocol).map_err(|e| e.to_string())?;
                if params.identity != expected {
                    return Err("identity does not match the login credential".to_string());
                }
                if let Some(tx) = init_tx.lock().unwrap().take() {
                    let _ = tx.send(params);
                }
                Ok(())
            }
        });
        connection.start();

        let handshake_deadline = Duration::from_secs(self.config.handshake_timeout_secs);
        let _params = match tokio::time::timeout(handshake_deadline, init_rx).await {
            Ok(Ok(params)) => params,
            Ok(Err(_)) | Err(_) => {
                connection.dispose();
                return Err(ServerError::Handshake(
                    "peer.init not completed in time".into(),
                ));
            }
        };

        let peer_id = new_peer_id();
        connection.add_peer(peer_id.clone(), user.identity.clone());

        let peer = Arc::new(Peer {
            id: peer_id.clone(),
            name: user.name.clone(),
            email: user.email.clone(),
            identity: user.identity.clone(),
            host: claim.host,
            room_id: claim.room_id.clone(),
            connection: connection.clone(),
        });

        // Attach to the room. Guests can race a vanished host here: the
        // token was approved, but the room may be gone by now.
        let existing = if claim.host {
            let permissions = RoomPermissions {
                guests_may_broadcast: self.config.guests_may_broadcast,
            };
            if let Err(e) = self
                .rooms
                .open_room(&claim.room_id, Arc::clone(&peer), permissions)
            {
                let _ = connection.send_clear_error(&e.to_string()).await;
                connection.dispose();
                return Err(e);
            }
            Vec::new()
        } else {
            match self.rooms.admit(&claim.room_id, Arc::clone(&peer)) {
                Ok(existing) => existing,
                Err(e) => {
                    warn!(room = %claim.room_id, "guest admission failed: {e}");
                    let _ = connection.send_clear_error(&e.to_string()).await;
                    connection.dispose();
                    return Err(e);
                }
            }
        };

        // The relay and the ready barrier go in before peer.onInfo: the
        // client may start sending sealed traffic the moment it sees it.
        connection.set_router(Arc::new(PeerRouter::new(
            Arc::clone(&self.rooms),
            peer_id.clone(),
            claim.room_id.clone(),
            connection.clone(),
        )));
        connection.mark_ready();

        // Assigned id, roster, and server identity
        let init_info = InitInfo {
            peer: peer.info(),
            room_id: claim.room_id.clone(),
            server: self.keypair.public(),
            roster: existing.iter().map(|p| p.info()).collect(),
        };
        if let Err(e) = connection
            .send_clear_notification(
                methods::PEER_ON_INFO,
                Target::Peer(peer_id.clone()),
                &init_info,
            )
            .await
        {
            // Keep join atomic: the peer never counted as admitted
            self.rooms.leave(&peer_id);
            connection.dispose();
            return Err(ServerError::Connection(e));
        }

        // Tell the rest of the room
        for member in &existing {
            if let Err(e) = member
                .connection
                .send_notification(
                    methods::ROOM_ON_JOIN,
                    Target::Peer(member.id.clone()),
                    &peer.info(),
                )
                .await
            {
                debug!(member = %member.id, "room.onJoin not delivered: {e}");
            }
        }

        // Drive room teardown from the connection's lifetime
        let ctx = Arc::clone(&self);
        let watched = peer_id.clone();
        tokio::spawn(async move {
            let _ = disconnects.recv().await;
            ctx.handle_leave(&watched).await;
        });

        info!(
            peer = %peer_id,
            room = %claim.room_id,
            host = claim.host,
            "peer attached"
        );
        Ok(peer)
    }

    /// Close a room outright: remove it and disconnect every member
    pub async fn close_room(&self, room_id: &str, reason: &str) -> Result<()> {
        let room = self
            .rooms
            .close_room(room_id)
            .ok_or_else(|| ServerError::UnknownRoom(room_id.to_string()))?;
        info!(room = %room_id, reason, "closing room");
        self.teardown_room(room, reason).await;
        Ok(())
    }

    /// Send `room.onClose` to every member and close their connections
    ///
    /// A member that is already gone (the host, when teardown follows its
    /// disconnect) just fails the notify; dispose is idempotent.
    async fn teardown_room(&self, room: Room, reason: &str) {
        let close = CloseInfo {
            reason: reason.to_string(),
        };
        for member in room.members() {
            if let Err(e) = member
                .connection
                .send_notification(
                    methods::ROOM_ON_CLOSE,
                    Target::Peer(member.id.clone()),
                    &close,
                )
                .await
            {
                debug!(member = %member.id, "room.onClose not delivered: {e}");
            }
            member.connection.dispose();
        }
    }

    /// Remove a departed peer and notify or tear down its room
    pub async fn handle_leave(self: &Arc<Self>, peer_id: &PeerId) {
        match self.rooms.leave(peer_id) {
            Some(LeaveOutcome::HostLost(room)) => {
                info!(room = %room.id, "host disconnected; closing room");
                self.teardown_room(room, "host disconnected").await;
            }
            Some(LeaveOutcome::GuestLeft {
                room_id,
                peer,
                remaining,
            }) => {
                debug!(room = %room_id, peer = %peer, "guest left room");
                let leave = LeaveInfo { peer };
                for member in &remaining {
                    if let Err(e) = member
                        .connection
                        .send_notification(
                            methods::ROOM_ON_LEAVE,
                            Target::Peer(member.id.clone()),
                            &leave,
                        )
                        .await
                    {
                        debug!(member = %member.id, "room.onLeave not delivered: {e}");
                    }
                }
            }
            None => {}
        }
    }
}
