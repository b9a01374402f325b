//! HTTP surface
//!
//! The three-step admission flow lives here: `POST /api/login` mints a
//! login token, `POST /api/session` (host) or `POST /api/session/{room}`
//! (guest, gated on host approval) turns it into a join token, and
//! `GET /api/session/join/{token}` upgrades to the WebSocket transport.
//! CORS is permissive: security comes from E2E encryption and tokens,
//! not origin checks.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use concord_crypto::PublicIdentity;
use concord_protocol::handshake::Workspace;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::debug;

use crate::error::ServerError;
use crate::server::ServerContext;
use crate::ws;
use crate::Result;

/// Maximum WebSocket message size, matching the wire frame cap
const MAX_WS_MESSAGE_SIZE: usize = concord_protocol::codec::MAX_FRAME_SIZE;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// Display name
    pub name: String,
    /// Optional email
    #[serde(default)]
    pub email: Option<String>,
    /// Hex-encoded public identity (64 bytes)
    pub identity: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    /// The minted token
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionRequest {
    /// A login token from `POST /api/login`
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    /// Join token for the host's connection
    pub token: String,
    /// The freshly allocated room id
    pub room: String,
}

#[derive(Debug, Serialize)]
pub struct JoinSessionResponse {
    /// Join token for the guest's connection
    pub token: String,
    /// Workspace descriptor shared by the host
    pub workspace: Workspace,
}

/// Build the axum router over the server context
pub fn router(ctx: Arc<ServerContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/login", post(login))
        .route("/api/session", post(create_session))
        .route("/api/session/{room_id}", post(join_session))
        .route("/api/session/join/{token}", get(join_ws))
        .route("/health", get(health))
        .layer(cors)
        .with_state(ctx)
}

async fn health() -> &'static str {
    "ok"
}

/// `POST /api/login`: authenticate and mint a login token
async fn login(
    State(ctx): State<Arc<ServerContext>>,
    Json(request): Json<LoginRequest>,
) -> Result<impl IntoResponse> {
    if request.name.trim().is_empty() {
        return Err(ServerError::InvalidCredentials);
    }
    let raw = hex::decode(&request.identity).map_err(|_| ServerError::InvalidCredentials)?;
    let identity =
        PublicIdentity::from_bytes(&raw).map_err(|_| ServerError::InvalidCredentials)?;

    let user = ctx
        .users
        .authenticate(request.name.trim(), request.email, identity);
    let token = ctx.credentials.mint_login_token(&user.id);
    debug!(user = %user.id, "login token minted");
    Ok((StatusCode::CREATED, Json(TokenResponse { token })))
}

/// `POST /api/session`: host allocates a room and gets a join token
async fn create_session(
    State(ctx): State<Arc<ServerContext>>,
    Json(request): Json<SessionRequest>,
) -> Result<impl IntoResponse> {
    let claim = ctx.credentials.redeem_login(&request.token)?;
    let user = ctx
        .users
        .get(&claim.user_id)
        .ok_or(ServerError::UnknownUser)?;

    let room = new_room_id();
    let token = ctx.credentials.mint_join_token(&user.id, &room, true);
    debug!(user = %user.id, room = %room, "room allocated");
    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse { token, room }),
    ))
}

/// `POST /api/session/{room_id}`: guest asks to join; host approves
async fn join_session(
    State(ctx): State<Arc<ServerContext>>,
    Path(room_id): Path<String>,
    Json(request): Json<SessionRequest>,
) -> Result<impl IntoResponse> {
    let claim = ctx.credentials.redeem_login(&request.token)?;
    let user = ctx
        .users
        .get(&claim.user_id)
        .ok_or(ServerError::UnknownUser)?;

    let (token, workspace) = ctx.join_request(&room_id, &user).await?;
    Ok((StatusCode::OK, Json(JoinSessionResponse { token, workspace })))
}

/// `GET /api/session/join/{token}`: redeem the join token and upgrade
async fn join_ws(
    State(ctx): State<Arc<ServerContext>>,
    Path(token): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Result<impl IntoResponse> {
    let claim = ctx.credentials.redeem_join(&token)?;
    if !claim.host && !ctx.rooms.exists(&claim.room_id) {
        return Err(ServerError::UnknownRoom(claim.room_id));
    }
    Ok(upgrade
        .max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |socket| ws::handle_socket(ctx, claim, socket)))
}

fn new_room_id() -> String {
    use rand::RngCore;
    let mut raw = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    hex::encode(raw)
}
