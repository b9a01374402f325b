//! Server configuration

use serde::{Deserialize, Serialize};

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP/WebSocket bind address
    pub bind_addr: String,
    /// Maximum concurrent rooms
    pub max_rooms: usize,
    /// Login token lifetime in seconds
    #[serde(default = "default_login_ttl")]
    pub login_token_ttl_secs: u64,
    /// Join token lifetime in seconds
    #[serde(default = "default_join_ttl")]
    pub join_token_ttl_secs: u64,
    /// How long the host may take to approve a join
    #[serde(default = "default_approval_timeout")]
    pub join_approval_timeout_secs: u64,
    /// Deadline for `peer.init` after the transport opens
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Interval of the expired-token sweep task
    #[serde(default = "default_sweep_interval")]
    pub token_sweep_interval_secs: u64,
    /// Whether guests may broadcast to the whole room
    #[serde(default = "default_guests_may_broadcast")]
    pub guests_may_broadcast: bool,
}

fn default_guests_may_broadcast() -> bool {
    true
}

fn default_login_ttl() -> u64 {
    600
}

fn default_join_ttl() -> u64 {
    300
}

fn default_approval_timeout() -> u64 {
    120
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_sweep_interval() -> u64 {
    30
}

impl ServerConfig {
    /// Minimum sweep interval (prevents a busy-looping sweeper)
    const MIN_SWEEP_INTERVAL: u64 = 5;

    /// Validate and clamp configuration values
    pub fn validate(&mut self) {
        if self.token_sweep_interval_secs < Self::MIN_SWEEP_INTERVAL {
            self.token_sweep_interval_secs = Self::MIN_SWEEP_INTERVAL;
        }
        if self.join_approval_timeout_secs == 0 {
            self.join_approval_timeout_secs = default_approval_timeout();
        }
        if self.handshake_timeout_secs == 0 {
            self.handshake_timeout_secs = default_handshake_timeout();
        }
        if self.bind_addr.parse::<std::net::SocketAddr>().is_err() {
            tracing::warn!("invalid bind_addr '{}', using default", self.bind_addr);
            self.bind_addr = default_bind_addr();
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8400".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_rooms: 5000,
            login_token_ttl_secs: default_login_ttl(),
            join_token_ttl_secs: default_join_ttl(),
            join_approval_timeout_secs: default_approval_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            token_sweep_interval_secs: default_sweep_interval(),
            guests_may_broadcast: default_guests_may_broadcast(),
        }
    }
}
