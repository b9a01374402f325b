//! Sealing content keys for individual recipients
//!
//! Ephemeral x25519 against the recipient's static key, blake3-derived KEK,
//! ChaCha20-Poly1305 wrap. One [`SealedKey`] per recipient per message (or
//! per content-key generation, when the sender's cache is warm).

use rand_core::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::domain::{DOMAIN_SEAL, DOMAIN_WRAP_AAD};
use crate::error::CryptoError;
use crate::keys::{Fingerprint, KeyPair, PublicIdentity};
use crate::symmetric::{self, ContentKey, KEY_SIZE, NONCE_SIZE};
use crate::Result;

/// A content key sealed under one recipient's public key
#[derive(Clone, PartialEq, Eq)]
pub struct SealedKey {
    /// Recipient the copy is addressed to
    pub fingerprint: Fingerprint,
    /// Sender's ephemeral x25519 public key
    pub ephemeral: [u8; 32],
    /// Wrap nonce
    pub nonce: [u8; NONCE_SIZE],
    /// AEAD-wrapped content key
    pub wrapped: Vec<u8>,
}

impl std::fmt::Debug for SealedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SealedKey(for {})", self.fingerprint.short())
    }
}

/// Seal a content key for one recipient
pub fn seal_key(key: &ContentKey, recipient: &PublicIdentity) -> Result<SealedKey> {
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);

    let shared = ephemeral.diffie_hellman(recipient.encrypt_key());
    let kek = blake3::derive_key(DOMAIN_SEAL, shared.as_bytes());

    let nonce = symmetric::random_nonce();
    let wrapped = symmetric::encrypt(&kek, &nonce, key.as_bytes(), DOMAIN_WRAP_AAD)?;

    Ok(SealedKey {
        fingerprint: recipient.fingerprint(),
        ephemeral: *ephemeral_public.as_bytes(),
        nonce,
        wrapped,
    })
}

/// Unseal a content key with the recipient's key pair
///
/// The caller has already matched `sealed.fingerprint` against its own;
/// a wrap that fails to open is [`CryptoError::Unauthenticated`], and an
/// opened wrap of the wrong shape is [`CryptoError::BadKey`].
pub fn unseal_key(sealed: &SealedKey, keypair: &KeyPair) -> Result<[u8; KEY_SIZE]> {
    let ephemeral = PublicKey::from(sealed.ephemeral);
    let shared = keypair.diffie_hellman(&ephemeral);
    let kek = blake3::derive_key(DOMAIN_SEAL, &shared);

    let opened = symmetric::decrypt(&kek, &sealed.nonce, &sealed.wrapped, DOMAIN_WRAP_AAD)?;
    let key: [u8; KEY_SIZE] = opened.try_into().map_err(|_| CryptoError::BadKey)?;
    Ok(key)
}
