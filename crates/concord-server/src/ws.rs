//! WebSocket ↔ transport adapter
//!
//! Bridges one upgraded WebSocket into the channel-pair [`Transport`] the
//! connection core consumes. Each binary WebSocket message carries a slice
//! of the length-prefixed envelope stream; the bridge moves bytes without
//! interpreting them. When either direction ends, the channels drop and
//! the connection core observes the disconnect.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMsg, WebSocket};
use bytes::Bytes;
use concord_net::Transport;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::credentials::JoinClaim;
use crate::server::ServerContext;

/// Buffered frames per direction
const BRIDGE_CAPACITY: usize = 256;

/// Drive one WebSocket client through handshake and relay
pub(crate) async fn handle_socket(ctx: Arc<ServerContext>, claim: JoinClaim, socket: WebSocket) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(BRIDGE_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel::<Bytes>(BRIDGE_CAPACITY);
    let transport = Transport::new(out_tx, in_rx);

    let room_id = claim.room_id.clone();
    let attach = tokio::spawn(Arc::clone(&ctx).attach_transport(transport, claim));

    let ws_to_conn = async {
        while let Some(message) = ws_stream.next().await {
            match message {
                Ok(WsMsg::Binary(data)) => {
                    if in_tx.send(data).await.is_err() {
                        break;
                    }
                }
                Ok(WsMsg::Ping(_)) | Ok(WsMsg::Pong(_)) => continue,
                Ok(WsMsg::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    };

    let conn_to_ws = async {
        while let Some(frame) = out_rx.recv().await {
            if ws_sink.send(WsMsg::Binary(frame)).await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = ws_to_conn => {}
        _ = conn_to_ws => {}
    }

    match attach.await {
        Ok(Ok(peer)) => debug!(peer = %peer.id, room = %room_id, "websocket session ended"),
        Ok(Err(e)) => warn!(room = %room_id, "websocket admission failed: {e}"),
        Err(e) => warn!("admission task failed: {e}"),
    }
}
