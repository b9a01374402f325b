//! Session layer for Concord
//!
//! The encrypted RPC engine shared by the relay server and peer clients:
//! a duplex frame transport, per-connection key caches, and the
//! request/response/notification/broadcast connection core.

#![forbid(unsafe_code)]

pub mod cache;
pub mod connection;
pub mod error;
pub mod session;
pub mod transport;

pub use connection::{Connection, Router};
pub use error::ConnectionError;
pub use session::{PeerSession, RoomEvent};
pub use transport::Transport;

/// Result type for session-layer operations
pub type Result<T> = std::result::Result<T, ConnectionError>;
