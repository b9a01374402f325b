//! Peer identities and long-term key pairs
//!
//! Every endpoint owns one [`KeyPair`]: an x25519 half for sealing content
//! keys and an ed25519 half for origin signatures. The public halves travel
//! together as a [`PublicIdentity`], identified by a blake3 [`Fingerprint`].

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::domain::{DOMAIN_FINGERPRINT, DOMAIN_SIG};
use crate::error::CryptoError;
use crate::Result;

/// Identity fingerprint: blake3 over the serialized public halves
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    /// Short hex prefix for logs
    pub fn short(&self) -> String {
        self.0[..4].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

/// Public half of a peer identity
#[derive(Clone, Serialize, Deserialize)]
pub struct PublicIdentity {
    #[serde(with = "encrypt_key_serde")]
    encrypt: PublicKey,
    #[serde(with = "verify_key_serde")]
    verify: VerifyingKey,
}

impl PublicIdentity {
    /// The x25519 public key content keys are sealed under
    pub fn encrypt_key(&self) -> &PublicKey {
        &self.encrypt
    }

    /// Serialized form: encrypt key followed by verify key
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(self.encrypt.as_bytes());
        out[32..].copy_from_slice(self.verify.as_bytes());
        out
    }

    /// Parse from the 64-byte serialized form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 64 {
            return Err(CryptoError::InvalidKey(format!(
                "identity must be 64 bytes, got {}",
                bytes.len()
            )));
        }
        let mut enc = [0u8; 32];
        enc.copy_from_slice(&bytes[..32]);
        let mut ver = [0u8; 32];
        ver.copy_from_slice(&bytes[32..]);
        let verify = VerifyingKey::from_bytes(&ver)
            .map_err(|e| CryptoError::InvalidKey(format!("bad verifying key: {e}")))?;
        Ok(Self {
            encrypt: PublicKey::from(enc),
            verify,
        })
    }

    /// Fingerprint of this identity
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint(blake3::derive_key(DOMAIN_FINGERPRINT, &self.to_bytes()))
    }

    /// Verify an origin signature made by this identity's key pair
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> Result<()> {
        let sig = Signature::from_bytes(signature);
        let mut signed = Vec::with_capacity(DOMAIN_SIG.len() + message.len());
        signed.extend_from_slice(DOMAIN_SIG);
        signed.extend_from_slice(message);
        self.verify
            .verify(&signed, &sig)
            .map_err(|_| CryptoError::Unauthenticated)
    }
}

impl PartialEq for PublicIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for PublicIdentity {}

impl std::fmt::Debug for PublicIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicIdentity({})", self.fingerprint().short())
    }
}

/// Long-term key pair for one endpoint
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyPair {
    #[serde(with = "secret_serde")]
    encrypt: StaticSecret,
    #[serde(with = "signing_serde")]
    sign: SigningKey,
}

impl KeyPair {
    /// Generate a fresh key pair
    pub fn generate() -> Self {
        Self {
            encrypt: StaticSecret::random_from_rng(OsRng),
            sign: SigningKey::generate(&mut OsRng),
        }
    }

    /// The public identity for this key pair
    pub fn public(&self) -> PublicIdentity {
        PublicIdentity {
            encrypt: PublicKey::from(&self.encrypt),
            verify: self.sign.verifying_key(),
        }
    }

    /// Fingerprint of the public identity
    pub fn fingerprint(&self) -> Fingerprint {
        self.public().fingerprint()
    }

    /// Diffie-Hellman with another party's encryption key
    pub fn diffie_hellman(&self, their_public: &PublicKey) -> [u8; 32] {
        *self.encrypt.diffie_hellman(their_public).as_bytes()
    }

    /// Sign a message as this identity
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        let mut signed = Vec::with_capacity(DOMAIN_SIG.len() + message.len());
        signed.extend_from_slice(DOMAIN_SIG);
        signed.extend_from_slice(message);
        self.sign.sign(&signed).to_bytes()
    }
}

impl Zeroize for KeyPair {
    fn zeroize(&mut self) {
        self.encrypt.zeroize();
        // SigningKey has no `Zeroize` impl in this ed25519-dalek version (only
        // `ZeroizeOnDrop`), so drop the old key to trigger its zeroizing `Drop`.
        self.sign = SigningKey::from_bytes(&[0u8; 32]);
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair({})", self.fingerprint().short())
    }
}

// Custom serde for StaticSecret
mod secret_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use x25519_dalek::StaticSecret;

    pub fn serialize<S>(secret: &StaticSecret, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        secret.to_bytes().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<StaticSecret, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = <[u8; 32]>::deserialize(deserializer)?;
        Ok(StaticSecret::from(bytes))
    }
}

// Custom serde for SigningKey
mod signing_serde {
    use ed25519_dalek::SigningKey;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(key: &SigningKey, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        key.to_bytes().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SigningKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = <[u8; 32]>::deserialize(deserializer)?;
        Ok(SigningKey::from_bytes(&bytes))
    }
}

// Custom serde for x25519 PublicKey
mod encrypt_key_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use x25519_dalek::PublicKey;

    pub fn serialize<S>(public: &PublicKey, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        public.as_bytes().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PublicKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = <[u8; 32]>::deserialize(deserializer)?;
        Ok(PublicKey::from(bytes))
    }
}

// Custom serde for VerifyingKey
mod verify_key_serde {
    use ed25519_dalek::VerifyingKey;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(key: &VerifyingKey, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        key.to_bytes().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<VerifyingKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = <[u8; 32]>::deserialize(deserializer)?;
        VerifyingKey::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_stable() {
        let kp = KeyPair::generate();
        assert_eq!(kp.fingerprint(), kp.public().fingerprint());
    }

    #[test]
    fn test_fingerprints_distinct() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_identity_roundtrip() {
        let kp = KeyPair::generate();
        let id = kp.public();
        let parsed = PublicIdentity::from_bytes(&id.to_bytes()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_identity_bad_length() {
        assert!(PublicIdentity::from_bytes(&[0u8; 63]).is_err());
    }

    #[test]
    fn test_sign_verify() {
        let kp = KeyPair::generate();
        let sig = kp.sign(b"hello");
        assert!(kp.public().verify(b"hello", &sig).is_ok());
    }

    #[test]
    fn test_sign_wrong_message() {
        let kp = KeyPair::generate();
        let sig = kp.sign(b"hello");
        assert_eq!(
            kp.public().verify(b"goodbye", &sig),
            Err(CryptoError::Unauthenticated)
        );
    }

    #[test]
    fn test_sign_wrong_identity() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let sig = kp.sign(b"hello");
        assert!(other.public().verify(b"hello", &sig).is_err());
    }

    #[test]
    fn test_diffie_hellman_agrees() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let ab = a.diffie_hellman(b.public().encrypt_key());
        let ba = b.diffie_hellman(a.public().encrypt_key());
        assert_eq!(ab, ba);
    }
}
