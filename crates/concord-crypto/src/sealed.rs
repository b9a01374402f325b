//! Hybrid-encrypted message payloads
//!
//! A [`SealedPayload`] is what travels inside an encrypted envelope: the
//! content AEAD-encrypted once under the sender's content key, that key
//! sealed once per recipient, and an origin signature over the ciphertext.
//! The relay forwards these blind; only listed recipients can open them.

use crate::domain::DOMAIN_CONTENT_AAD;
use crate::error::CryptoError;
use crate::keys::{Fingerprint, KeyPair, PublicIdentity};
use crate::seal::{self, SealedKey};
use crate::symmetric::{self, ContentKey, KEY_SIZE, NONCE_SIZE};
use crate::Result;

/// An encrypted message body with per-recipient key copies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    /// One sealed content-key copy per recipient
    pub keys: Vec<SealedKey>,
    /// Content AEAD nonce
    pub nonce: [u8; NONCE_SIZE],
    /// Sender's signature over nonce ‖ ciphertext
    pub signature: [u8; 64],
    /// AEAD ciphertext of the serialized content
    pub ciphertext: Vec<u8>,
}

impl SealedPayload {
    /// Encrypt content under `key`, attaching pre-sealed recipient copies
    ///
    /// The sealed copies come from the caller so a warm key cache can skip
    /// the asymmetric work; see `seal::seal_key` for producing them. An
    /// empty recipient list is refused: a zero-recipient payload cannot be
    /// opened by anyone.
    pub fn encrypt(
        content: &[u8],
        key: &ContentKey,
        sender: &KeyPair,
        keys: Vec<SealedKey>,
    ) -> Result<Self> {
        if keys.is_empty() {
            return Err(CryptoError::NoRecipients);
        }

        let nonce = symmetric::random_nonce();
        let ciphertext = symmetric::encrypt(key.as_bytes(), &nonce, content, DOMAIN_CONTENT_AAD)?;
        let signature = sender.sign(&signed_bytes(&nonce, &ciphertext));

        Ok(Self {
            keys,
            nonce,
            signature,
            ciphertext,
        })
    }

    /// The sealed copy addressed to `fingerprint`, if any
    pub fn sealed_for(&self, fingerprint: &Fingerprint) -> Option<&SealedKey> {
        self.keys.iter().find(|k| &k.fingerprint == fingerprint)
    }

    /// Open the content with an already-unwrapped content key (cache hit)
    pub fn open_with_key(&self, key: &[u8; KEY_SIZE]) -> Result<Vec<u8>> {
        symmetric::decrypt(key, &self.nonce, &self.ciphertext, DOMAIN_CONTENT_AAD)
    }

    /// Unseal our key copy and open the content
    ///
    /// Returns the plaintext and the unwrapped content key so the caller
    /// can cache it for subsequent messages from the same sender.
    pub fn open(&self, keypair: &KeyPair) -> Result<(Vec<u8>, [u8; KEY_SIZE])> {
        let sealed = self
            .sealed_for(&keypair.fingerprint())
            .ok_or(CryptoError::NoKeyForMe)?;
        let key = seal::unseal_key(sealed, keypair)?;
        let content = self.open_with_key(&key)?;
        Ok((content, key))
    }

    /// Verify the origin signature against the claimed sender
    pub fn verify_origin(&self, sender: &PublicIdentity) -> Result<()> {
        sender.verify(&signed_bytes(&self.nonce, &self.ciphertext), &self.signature)
    }
}

fn signed_bytes(nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(nonce);
    out.extend_from_slice(ciphertext);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seal::seal_key;

    fn sealed_for_all(
        key: &ContentKey,
        recipients: &[&KeyPair],
    ) -> Vec<SealedKey> {
        recipients
            .iter()
            .map(|r| seal_key(key, &r.public()).unwrap())
            .collect()
    }

    #[test]
    fn test_every_recipient_recovers_content() {
        let sender = KeyPair::generate();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let key = ContentKey::generate();

        let keys = sealed_for_all(&key, &[&alice, &bob]);
        let payload = SealedPayload::encrypt(b"room update", &key, &sender, keys).unwrap();

        for recipient in [&alice, &bob] {
            let (content, unwrapped) = payload.open(recipient).unwrap();
            assert_eq!(content, b"room update");
            assert_eq!(&unwrapped, key.as_bytes());
        }
    }

    #[test]
    fn test_outsider_gets_no_key_for_me() {
        let sender = KeyPair::generate();
        let alice = KeyPair::generate();
        let eve = KeyPair::generate();
        let key = ContentKey::generate();

        let keys = sealed_for_all(&key, &[&alice]);
        let payload = SealedPayload::encrypt(b"private", &key, &sender, keys).unwrap();

        assert!(matches!(payload.open(&eve), Err(CryptoError::NoKeyForMe)));
    }

    #[test]
    fn test_zero_recipients_refused() {
        let sender = KeyPair::generate();
        let key = ContentKey::generate();
        assert_eq!(
            SealedPayload::encrypt(b"x", &key, &sender, Vec::new()),
            Err(CryptoError::NoRecipients)
        );
    }

    #[test]
    fn test_origin_signature_verifies() {
        let sender = KeyPair::generate();
        let alice = KeyPair::generate();
        let key = ContentKey::generate();

        let keys = sealed_for_all(&key, &[&alice]);
        let payload = SealedPayload::encrypt(b"hi", &key, &sender, keys).unwrap();

        assert!(payload.verify_origin(&sender.public()).is_ok());
        assert!(payload.verify_origin(&alice.public()).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let sender = KeyPair::generate();
        let alice = KeyPair::generate();
        let key = ContentKey::generate();

        let keys = sealed_for_all(&key, &[&alice]);
        let mut payload = SealedPayload::encrypt(b"hi", &key, &sender, keys).unwrap();
        if let Some(b) = payload.ciphertext.first_mut() {
            *b ^= 0xFF;
        }

        assert!(payload.verify_origin(&sender.public()).is_err());
        assert!(matches!(
            payload.open(&alice),
            Err(CryptoError::Unauthenticated)
        ));
    }

    #[test]
    fn test_cached_key_opens_later_payloads() {
        let sender = KeyPair::generate();
        let alice = KeyPair::generate();
        let key = ContentKey::generate();

        let first = SealedPayload::encrypt(
            b"one",
            &key,
            &sender,
            sealed_for_all(&key, &[&alice]),
        )
        .unwrap();
        let (_, cached) = first.open(&alice).unwrap();

        // Same content key reused for the next message; the cached unwrap
        // opens it without touching the sealed copies.
        let second = SealedPayload::encrypt(
            b"two",
            &key,
            &sender,
            sealed_for_all(&key, &[&alice]),
        )
        .unwrap();
        assert_eq!(second.open_with_key(&cached).unwrap(), b"two");
    }
}
