//! Message envelopes
//!
//! The six envelope variants that cross the wire. Everything after the
//! admission handshake travels with a [`Body::Sealed`] payload; the relay
//! routes on the envelope header (kind, origin, target) and never needs the
//! body plaintext.

use concord_crypto::SealedPayload;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::Result;

/// Opaque peer identifier assigned by the server
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    /// Borrow the raw id text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Where an envelope is addressed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The relay server itself
    Server,
    /// One peer in the sender's room
    Peer(PeerId),
    /// Every other peer in the sender's room
    All,
}

/// Decrypted (or handshake-cleartext) message content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    /// Method name; empty for responses
    pub method: String,
    /// Postcard-encoded parameters or result
    pub payload: Vec<u8>,
}

impl Content {
    /// Build content from a method name and typed parameters
    pub fn new<T: Serialize>(method: &str, params: &T) -> Result<Self> {
        let payload =
            postcard::to_stdvec(params).map_err(|e| ProtocolError::Payload(e.to_string()))?;
        Ok(Self {
            method: method.to_string(),
            payload,
        })
    }

    /// Build response content (no method) from a typed result
    pub fn result<T: Serialize>(value: &T) -> Result<Self> {
        Self::new("", value)
    }

    /// Decode the payload into a typed value
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        postcard::from_bytes(&self.payload).map_err(|e| ProtocolError::Payload(e.to_string()))
    }

    /// Serialized form carried inside sealed bodies
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        postcard::to_stdvec(self).map_err(|e| ProtocolError::Payload(e.to_string()))
    }

    /// Parse the serialized form recovered from a sealed body
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        postcard::from_bytes(bytes).map_err(|e| ProtocolError::Payload(e.to_string()))
    }
}

/// Envelope body: cleartext control during the handshake, sealed after
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Handshake-only plaintext content
    Clear(Content),
    /// Hybrid-encrypted content
    Sealed(SealedPayload),
}

/// A unit of the wire protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Expects a `Response` or `ResponseError` correlated by `id`
    Request {
        /// Sender-monotonic correlation id
        id: u64,
        /// Authenticated sender; empty only during the handshake
        origin: Option<PeerId>,
        /// Recipient
        target: Target,
        /// Method and parameters
        body: Body,
    },
    /// Successful reply to a `Request`
    Response {
        /// Correlation id of the request
        id: u64,
        /// Responder
        origin: Option<PeerId>,
        /// The requester, copied from the request's origin
        target: Target,
        /// Result content
        body: Body,
    },
    /// Failed reply to a `Request`
    ResponseError {
        /// Correlation id of the request
        id: u64,
        /// Responder
        origin: Option<PeerId>,
        /// The requester, copied from the request's origin
        target: Target,
        /// Error message content
        body: Body,
    },
    /// Fire-and-forget unicast
    Notification {
        /// Authenticated sender
        origin: Option<PeerId>,
        /// Recipient
        target: Target,
        /// Method and parameters
        body: Body,
    },
    /// Fire-and-forget room fanout
    Broadcast {
        /// Authenticated sender
        origin: Option<PeerId>,
        /// Method and parameters
        body: Body,
    },
    /// Out-of-band error report
    Error {
        /// Sender
        origin: Option<PeerId>,
        /// Error message content
        body: Body,
    },
}

impl Envelope {
    /// The sender recorded on the envelope
    pub fn origin(&self) -> Option<&PeerId> {
        match self {
            Envelope::Request { origin, .. }
            | Envelope::Response { origin, .. }
            | Envelope::ResponseError { origin, .. }
            | Envelope::Notification { origin, .. }
            | Envelope::Broadcast { origin, .. }
            | Envelope::Error { origin, .. } => origin.as_ref(),
        }
    }

    /// Overwrite the sender (the relay stamps the authenticated peer id)
    pub fn set_origin(&mut self, peer: PeerId) {
        match self {
            Envelope::Request { origin, .. }
            | Envelope::Response { origin, .. }
            | Envelope::ResponseError { origin, .. }
            | Envelope::Notification { origin, .. }
            | Envelope::Broadcast { origin, .. }
            | Envelope::Error { origin, .. } => *origin = Some(peer),
        }
    }

    /// The target, for variants that carry one
    pub fn target(&self) -> Option<&Target> {
        match self {
            Envelope::Request { target, .. }
            | Envelope::Response { target, .. }
            | Envelope::ResponseError { target, .. }
            | Envelope::Notification { target, .. } => Some(target),
            Envelope::Broadcast { .. } | Envelope::Error { .. } => None,
        }
    }

    /// The body, regardless of variant
    pub fn body(&self) -> &Body {
        match self {
            Envelope::Request { body, .. }
            | Envelope::Response { body, .. }
            | Envelope::ResponseError { body, .. }
            | Envelope::Notification { body, .. }
            | Envelope::Broadcast { body, .. }
            | Envelope::Error { body, .. } => body,
        }
    }

    /// Short name for logging
    pub fn kind_name(&self) -> &'static str {
        match self {
            Envelope::Request { .. } => "request",
            Envelope::Response { .. } => "response",
            Envelope::ResponseError { .. } => "response-error",
            Envelope::Notification { .. } => "notification",
            Envelope::Broadcast { .. } => "broadcast",
            Envelope::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Params {
        text: String,
        count: u32,
    }

    #[test]
    fn test_content_typed_roundtrip() {
        let params = Params {
            text: "hi".into(),
            count: 3,
        };
        let content = Content::new("echo", &params).unwrap();
        assert_eq!(content.method, "echo");
        assert_eq!(content.parse::<Params>().unwrap(), params);
    }

    #[test]
    fn test_content_bytes_roundtrip() {
        let content = Content::new("echo", &"x").unwrap();
        let bytes = content.to_bytes().unwrap();
        assert_eq!(Content::from_bytes(&bytes).unwrap(), content);
    }

    #[test]
    fn test_origin_rewrite() {
        let mut env = Envelope::Broadcast {
            origin: Some(PeerId::from("spoofed")),
            body: Body::Clear(Content::new("note", &()).unwrap()),
        };
        env.set_origin(PeerId::from("real"));
        assert_eq!(env.origin(), Some(&PeerId::from("real")));
    }

    #[test]
    fn test_targets() {
        let env = Envelope::Notification {
            origin: None,
            target: Target::Peer(PeerId::from("p1")),
            body: Body::Clear(Content::new("m", &()).unwrap()),
        };
        assert_eq!(env.target(), Some(&Target::Peer(PeerId::from("p1"))));

        let broadcast = Envelope::Broadcast {
            origin: None,
            body: Body::Clear(Content::new("m", &()).unwrap()),
        };
        assert_eq!(broadcast.target(), None);
    }
}
