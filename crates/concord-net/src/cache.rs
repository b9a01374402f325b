//! Per-connection key caches
//!
//! Two maps per connection: sealed content-key copies by recipient
//! fingerprint (skips the asymmetric seal on reuse) and unwrapped content
//! keys by sender fingerprint (skips the asymmetric unseal). Bounded at
//! `known peers + 50`; overflow drops the whole map, not an LRU victim.
//! Both maps are dropped whenever the peer set changes.

use std::collections::HashMap;

use concord_crypto::{ContentKey, Fingerprint, SealedKey};

/// Extra capacity on top of the known-peer count
const CACHE_SLACK: usize = 50;

/// Encryption- and decryption-side key caches for one connection
#[derive(Debug, Default)]
pub struct KeyCaches {
    /// recipient fingerprint → (content-key generation, sealed copy)
    encryption: HashMap<Fingerprint, (u32, SealedKey)>,
    /// sender fingerprint → unwrapped content key
    decryption: HashMap<Fingerprint, ContentKey>,
}

impl KeyCaches {
    /// Fresh, empty caches
    pub fn new() -> Self {
        Self::default()
    }

    fn bound(known_peers: usize) -> usize {
        known_peers + CACHE_SLACK
    }

    /// Cached sealed copy for a recipient, if it matches the generation
    pub fn sealed_copy(&self, recipient: &Fingerprint, generation: u32) -> Option<SealedKey> {
        self.encryption
            .get(recipient)
            .filter(|(gen, _)| *gen == generation)
            .map(|(_, key)| key.clone())
    }

    /// Store a sealed copy, dropping the map first if it would overflow
    pub fn store_sealed_copy(
        &mut self,
        recipient: Fingerprint,
        generation: u32,
        key: SealedKey,
        known_peers: usize,
    ) {
        if self.encryption.len() >= Self::bound(known_peers)
            && !self.encryption.contains_key(&recipient)
        {
            self.encryption.clear();
        }
        self.encryption.insert(recipient, (generation, key));
    }

    /// Cached unwrapped content key for a sender
    pub fn unwrapped_key(&self, sender: &Fingerprint) -> Option<&ContentKey> {
        self.decryption.get(sender)
    }

    /// Store an unwrapped content key, dropping the map first on overflow
    pub fn store_unwrapped_key(
        &mut self,
        sender: Fingerprint,
        key: ContentKey,
        known_peers: usize,
    ) {
        if self.decryption.len() >= Self::bound(known_peers)
            && !self.decryption.contains_key(&sender)
        {
            self.decryption.clear();
        }
        self.decryption.insert(sender, key);
    }

    /// Drop everything; called whenever the peer set changes
    pub fn clear(&mut self) {
        self.encryption.clear();
        self.decryption.clear();
    }

    /// Current encryption-side entry count
    pub fn encryption_len(&self) -> usize {
        self.encryption.len()
    }

    /// Current decryption-side entry count
    pub fn decryption_len(&self) -> usize {
        self.decryption.len()
    }
}
