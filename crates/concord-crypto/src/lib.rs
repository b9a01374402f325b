//! Cryptographic primitives for Concord
//!
//! Hybrid encryption for relayed messages: one symmetric content key per
//! sender, sealed once per recipient under that recipient's public key, plus
//! origin signatures and fingerprint identities. The relay never holds key
//! material; everything here runs on the endpoints.

#![forbid(unsafe_code)]

pub mod domain;
pub mod error;
pub mod keys;
pub mod seal;
pub mod sealed;
pub mod symmetric;

pub use error::CryptoError;
pub use keys::{Fingerprint, KeyPair, PublicIdentity};
pub use seal::SealedKey;
pub use sealed::SealedPayload;
pub use symmetric::ContentKey;

/// Result type for cryptographic operations
pub type Result<T> = std::result::Result<T, CryptoError>;
