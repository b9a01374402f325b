//! Session-layer error types

use concord_crypto::CryptoError;
use concord_protocol::{PeerId, ProtocolError};
use thiserror::Error;

/// Errors surfaced by the connection core
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The request exceeded its deadline
    #[error("request timed out")]
    Timeout,

    /// Transport closed or connection disposed before completion
    #[error("connection closed")]
    Disconnected,

    /// The remote handler answered with an error
    #[error("remote error: {0}")]
    Remote(String),

    /// Encrypt/decrypt/unseal failure on a message
    #[error("crypto failure: {0}")]
    Crypto(#[from] CryptoError),

    /// Envelope could not be encoded or decoded
    #[error("protocol failure: {0}")]
    Protocol(#[from] ProtocolError),

    /// No identity known for the addressed peer
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    /// Handshake did not complete
    #[error("handshake failed: {0}")]
    Handshake(String),
}
