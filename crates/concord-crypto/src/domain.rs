//! Domain separation constants for cryptographic operations
//!
//! These constants ensure that operations in different contexts produce
//! different outputs, even with the same inputs.

/// Domain separator for identity fingerprints
pub const DOMAIN_FINGERPRINT: &str = "concord.fingerprint.v1";

/// Domain separator for the key-encapsulation KEK derivation
pub const DOMAIN_SEAL: &str = "concord.seal.v1";

/// AAD for sealed content-key wraps
pub const DOMAIN_WRAP_AAD: &[u8] = b"concord-wrap-v1";

/// AAD for message content encryption
pub const DOMAIN_CONTENT_AAD: &[u8] = b"concord-content-v1";

/// Domain separator for origin signatures
pub const DOMAIN_SIG: &[u8] = b"concord.signature.v1";
