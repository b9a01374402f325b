//! ChaCha20-Poly1305 content encryption
//!
//! One [`ContentKey`] per sender, carried across messages; the generation
//! counter lets key caches detect a rotated key without inspecting bytes.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::Result;

/// Symmetric key size in bytes
pub const KEY_SIZE: usize = 32;

/// AEAD nonce size in bytes
pub const NONCE_SIZE: usize = 12;

/// Per-sender symmetric content key
#[derive(Clone)]
pub struct ContentKey {
    bytes: [u8; KEY_SIZE],
    generation: u32,
}

impl ContentKey {
    /// Generate a fresh content key at generation zero
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self {
            bytes,
            generation: 0,
        }
    }

    /// Build from raw bytes, keeping the caller's generation
    pub fn from_bytes(bytes: [u8; KEY_SIZE], generation: u32) -> Self {
        Self { bytes, generation }
    }

    /// Replace the key material and bump the generation
    pub fn rotate(&mut self) {
        self.bytes.zeroize();
        rand::rngs::OsRng.fill_bytes(&mut self.bytes);
        self.generation += 1;
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Generation counter, bumped on rotation
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl Zeroize for ContentKey {
    fn zeroize(&mut self) {
        self.bytes.zeroize();
    }
}

impl Drop for ContentKey {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentKey(gen {})", self.generation)
    }
}

/// Generate a random AEAD nonce
pub fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt with ChaCha20-Poly1305
///
/// Returns ciphertext with the authentication tag appended.
pub fn encrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|e| CryptoError::Encryption(format!("ChaCha20 encryption failed: {e}")))
}

/// Decrypt with ChaCha20-Poly1305
///
/// Fails with [`CryptoError::Unauthenticated`] on tag mismatch.
pub fn decrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::Unauthenticated)
}
