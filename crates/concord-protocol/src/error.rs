//! Protocol error types

use thiserror::Error;

/// Protocol-layer errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame bytes could not be parsed into an envelope
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Frame exceeds the wire size cap
    #[error("frame too large ({size} bytes, max {max})")]
    FrameTooLarge {
        /// Declared frame size
        size: usize,
        /// Maximum allowed
        max: usize,
    },

    /// Peer speaks a different protocol version
    #[error("protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch {
        /// Our version
        local: String,
        /// The peer's version
        remote: String,
    },

    /// Envelope field could not be encoded
    #[error("encoding error: {0}")]
    Encode(String),

    /// Typed payload could not be serialized/deserialized
    #[error("payload error: {0}")]
    Payload(String),

    /// IO error from the underlying transport
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
