//! Error types for cryptographic operations

use thiserror::Error;

/// Errors that can occur during cryptographic operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Error during key generation
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Error during encryption
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// AEAD tag or origin signature did not verify
    #[error("message failed authentication")]
    Unauthenticated,

    /// No sealed key copy matches the recipient's fingerprint
    #[error("no sealed key for this recipient")]
    NoKeyForMe,

    /// Unwrapped key material is malformed
    #[error("unwrapped key is malformed")]
    BadKey,

    /// Refused to seal a payload for an empty recipient set
    #[error("no recipients to seal for")]
    NoRecipients,

    /// Invalid key material
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}
