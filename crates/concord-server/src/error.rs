//! Server error types and their HTTP mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use concord_net::ConnectionError;
use concord_protocol::PeerId;
use thiserror::Error;

/// Errors from admission, room, and relay operations
#[derive(Error, Debug)]
pub enum ServerError {
    /// Login proof was rejected
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Token is unknown or already consumed
    #[error("invalid or unknown token")]
    InvalidToken,

    /// Token exists but its lifetime elapsed
    #[error("token expired")]
    TokenExpired,

    /// No such room
    #[error("unknown room {0}")]
    UnknownRoom(String),

    /// The host denied the join request
    #[error("room access denied")]
    Denied,

    /// The host did not answer the join request in time
    #[error("join approval timed out")]
    ApprovalTimeout,

    /// Server is at its room capacity
    #[error("server at room capacity")]
    AtCapacity,

    /// A room with this id is already open
    #[error("room {0} already exists")]
    RoomExists(String),

    /// The peer is already a member of a room
    #[error("peer {0} is already in a room")]
    AlreadyInRoom(PeerId),

    /// Login token resolved to a user that no longer exists
    #[error("unknown user")]
    UnknownUser,

    /// Admission handshake failed
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Session-layer failure
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
}

impl ServerError {
    /// HTTP status this error surfaces as
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidCredentials | Self::InvalidToken | Self::UnknownUser => {
                StatusCode::UNAUTHORIZED
            }
            Self::TokenExpired => StatusCode::GONE,
            Self::UnknownRoom(_) => StatusCode::NOT_FOUND,
            Self::Denied => StatusCode::FORBIDDEN,
            Self::ApprovalTimeout => StatusCode::REQUEST_TIMEOUT,
            Self::AtCapacity => StatusCode::SERVICE_UNAVAILABLE,
            Self::RoomExists(_) | Self::AlreadyInRoom(_) => StatusCode::CONFLICT,
            Self::Handshake(_) | Self::Connection(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (self.status(), body).into_response()
    }
}
