//! Concord wire protocol
//!
//! Defines the message envelopes exchanged between peers and the relay
//! server, the length-prefixed binary codec that frames them, and the typed
//! handshake payloads carried during admission.

#![forbid(unsafe_code)]

pub mod codec;
pub mod envelope;
pub mod error;
pub mod handshake;
pub mod version;

pub use codec::EnvelopeCodec;
pub use envelope::{Body, Content, Envelope, PeerId, Target};
pub use error::ProtocolError;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
