//! Login and join token management
//!
//! Tokens are 128-bit random values, hex-encoded for URL safety, stored
//! keyed by their BLAKE3 hash and single-use: redeeming removes the entry.
//! Expiry is checked at redemption so the background sweep only reclaims
//! memory, never grants extra lifetime.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::error::ServerError;
use crate::Result;

/// Random bytes per token (128 bits)
const TOKEN_BYTES: usize = 16;

/// What a redeemed login token proves
#[derive(Debug, Clone)]
pub struct LoginClaim {
    /// The authenticated user
    pub user_id: String,
}

/// What a redeemed join token authorises
#[derive(Debug, Clone)]
pub struct JoinClaim {
    /// The authenticated user
    pub user_id: String,
    /// The room this token admits to
    pub room_id: String,
    /// Whether the connection will host the room
    pub host: bool,
}

struct Stored<T> {
    token: String,
    expires_at: Instant,
    claim: T,
}

/// Mints and validates the two token kinds
pub struct CredentialsManager {
    login_tokens: DashMap<[u8; 32], Stored<LoginClaim>>,
    join_tokens: DashMap<[u8; 32], Stored<JoinClaim>>,
    login_ttl: Duration,
    join_ttl: Duration,
}

fn new_token() -> String {
    let mut raw = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    hex::encode(raw)
}

fn token_key(token: &str) -> [u8; 32] {
    *blake3::hash(token.as_bytes()).as_bytes()
}

impl CredentialsManager {
    /// Create a manager with the given token lifetimes
    pub fn new(login_ttl: Duration, join_ttl: Duration) -> Self {
        Self {
            login_tokens: DashMap::new(),
            join_tokens: DashMap::new(),
            login_ttl,
            join_ttl,
        }
    }

    /// Mint a login token for an authenticated user
    pub fn mint_login_token(&self, user_id: &str) -> String {
        let token = new_token();
        self.login_tokens.insert(
            token_key(&token),
            Stored {
                token: token.clone(),
                expires_at: Instant::now() + self.login_ttl,
                claim: LoginClaim {
                    user_id: user_id.to_string(),
                },
            },
        );
        token
    }

    /// Validate and consume a login token
    pub fn redeem_login(&self, token: &str) -> Result<LoginClaim> {
        let (_, stored) = self
            .login_tokens
            .remove(&token_key(token))
            .ok_or(ServerError::InvalidToken)?;
        verify(&stored, token)?;
        Ok(stored.claim)
    }

    /// Mint a join token binding a user to one room
    pub fn mint_join_token(&self, user_id: &str, room_id: &str, host: bool) -> String {
        let token = new_token();
        self.join_tokens.insert(
            token_key(&token),
            Stored {
                token: token.clone(),
                expires_at: Instant::now() + self.join_ttl,
                claim: JoinClaim {
                    user_id: user_id.to_string(),
                    room_id: room_id.to_string(),
                    host,
                },
            },
        );
        token
    }

    /// Validate and consume a join token
    pub fn redeem_join(&self, token: &str) -> Result<JoinClaim> {
        let (_, stored) = self
            .join_tokens
            .remove(&token_key(token))
            .ok_or(ServerError::InvalidToken)?;
        verify(&stored, token)?;
        Ok(stored.claim)
    }

    /// Drop expired tokens; returns how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.login_tokens.retain(|_, stored| {
            let keep = stored.expires_at > now;
            if !keep {
                removed += 1;
            }
            keep
        });
        self.join_tokens.retain(|_, stored| {
            let keep = stored.expires_at > now;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Run the sweep on an interval until the manager is dropped
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                let removed = manager.sweep();
                if removed > 0 {
                    debug!("swept {removed} expired tokens");
                }
            }
        })
    }

    /// Outstanding token count across both kinds
    pub fn token_count(&self) -> usize {
        self.login_tokens.len() + self.join_tokens.len()
    }
}

fn verify<T>(stored: &Stored<T>, presented: &str) -> Result<()> {
    // Constant-time match of the presented token against the stored copy
    if stored
        .token
        .as_bytes()
        .ct_eq(presented.as_bytes())
        .unwrap_u8()
        == 0
    {
        return Err(ServerError::InvalidToken);
    }
    if stored.expires_at <= Instant::now() {
        return Err(ServerError::TokenExpired);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> CredentialsManager {
        CredentialsManager::new(Duration::from_secs(600), Duration::from_secs(300))
    }

    #[test]
    fn test_login_token_roundtrip() {
        let creds = manager();
        let token = creds.mint_login_token("u1");
        let claim = creds.redeem_login(&token).unwrap();
        assert_eq!(claim.user_id, "u1");
    }

    #[test]
    fn test_tokens_are_single_use() {
        let creds = manager();
        let token = creds.mint_login_token("u1");
        creds.redeem_login(&token).unwrap();
        assert!(matches!(
            creds.redeem_login(&token),
            Err(ServerError::InvalidToken)
        ));
    }

    #[test]
    fn test_unknown_token_rejected() {
        let creds = manager();
        assert!(matches!(
            creds.redeem_login("deadbeef"),
            Err(ServerError::InvalidToken)
        ));
    }

    #[test]
    fn test_expired_token_rejected_at_lookup() {
        let creds = CredentialsManager::new(Duration::ZERO, Duration::ZERO);
        let token = creds.mint_join_token("u1", "r1", false);
        assert!(matches!(
            creds.redeem_join(&token),
            Err(ServerError::TokenExpired)
        ));
    }

    #[test]
    fn test_join_claim_carries_room_and_role() {
        let creds = manager();
        let token = creds.mint_join_token("u1", "r1", true);
        let claim = creds.redeem_join(&token).unwrap();
        assert_eq!(claim.user_id, "u1");
        assert_eq!(claim.room_id, "r1");
        assert!(claim.host);
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let creds = CredentialsManager::new(Duration::ZERO, Duration::from_secs(300));
        creds.mint_login_token("u1");
        creds.mint_join_token("u1", "r1", false);
        assert_eq!(creds.token_count(), 2);

        let removed = creds.sweep();
        assert_eq!(removed, 1);
        assert_eq!(creds.token_count(), 1);
    }

    #[test]
    fn test_tokens_are_distinct_and_urlsafe() {
        let creds = manager();
        let a = creds.mint_login_token("u1");
        let b = creds.mint_login_token("u1");
        assert_ne!(a, b);
        assert_eq!(a.len(), TOKEN_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
