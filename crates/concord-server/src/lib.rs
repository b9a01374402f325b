//! Concord relay server
//!
//! Binds the HTTP/WebSocket surface to the room, credentials, and user
//! managers, runs the admission handshake on new transports, and relays
//! sealed envelopes between room members without ever decrypting them.

#![forbid(unsafe_code)]

pub mod config;
pub mod credentials;
pub mod error;
pub mod http;
pub mod peer;
pub mod relay;
pub mod room;
pub mod server;
pub mod users;
mod ws;

pub use config::ServerConfig;
pub use error::ServerError;
pub use server::ServerContext;

/// Result type for server operations
pub type Result<T> = std::result::Result<T, ServerError>;
