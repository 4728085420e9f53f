//! Server and client configuration.
//!
//! Every tunable has a default; a TOML file only needs the keys it changes:
//!
//! ```toml
//! bind_addr = "0.0.0.0:9090"
//! typing_ttl_ms = 3000
//!
//! [rate_limit]
//! max_commands = 30
//! window_ms = 10000
//!
//! [dev_tokens]
//! "alice-token" = "alice"
//!
//! [dev_groups]
//! g1 = ["alice", "bob"]
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::protocol::{GroupId, UserId};

/// Environment variable that overrides [`ServerConfig::bind_addr`].
pub const BIND_ADDR_ENV: &str = "GROUPLINE_BIND_ADDR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Limits applied to every inbound command payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PayloadLimits {
    pub max_content_chars: usize,
    pub max_attachments: usize,
    pub max_emoji_bytes: usize,
}

impl Default for PayloadLimits {
    fn default() -> Self {
        Self {
            max_content_chars: 4000,
            max_attachments: 10,
            max_emoji_bytes: 32,
        }
    }
}

/// Fixed-window command budget per session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_commands: u32,
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_commands: 30,
            window_ms: 10_000,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per session before deliveries start failing
    pub outbound_capacity: usize,
    /// Jobs buffered per group dispatch worker
    pub group_queue_capacity: usize,
    /// How often the heartbeat reaper runs
    pub heartbeat_interval_secs: u64,
    /// Joined sessions silent for longer than this are closed
    pub session_timeout_secs: u64,
    /// Connections must authenticate within this window
    pub auth_timeout_secs: u64,
    pub typing_ttl_ms: u64,
    pub typing_sweep_interval_ms: u64,
    /// Messages can be edited for this long after creation (24h)
    pub edit_window_secs: u64,
    /// Number of recent `tempId`s remembered for send de-duplication
    pub send_dedupe_capacity: usize,
    pub rate_limit: RateLimitConfig,
    pub limits: PayloadLimits,
    /// Permanent tokens for local development: token → user id
    pub dev_tokens: HashMap<String, UserId>,
    /// Group rosters for local development: group id → members
    pub dev_groups: HashMap<GroupId, Vec<UserId>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbound_capacity: 256,
            group_queue_capacity: 1024,
            heartbeat_interval_secs: 30,
            session_timeout_secs: 90,
            auth_timeout_secs: 10,
            typing_ttl_ms: 3000,
            typing_sweep_interval_ms: 500,
            edit_window_secs: 24 * 60 * 60,
            send_dedupe_capacity: 1024,
            rate_limit: RateLimitConfig::default(),
            limits: PayloadLimits::default(),
            dev_tokens: HashMap::new(),
            dev_groups: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Apply `GROUPLINE_BIND_ADDR` if set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var(BIND_ADDR_ENV) {
            if !addr.trim().is_empty() {
                self.bind_addr = addr;
            }
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn typing_ttl(&self) -> Duration {
        Duration::from_millis(self.typing_ttl_ms)
    }

    pub fn typing_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.typing_sweep_interval_ms)
    }

    pub fn edit_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.edit_window_secs as i64)
    }
}

/// Reconnect and keep-alive policy for the client state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// First retry delay; doubles per attempt
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Keep-alive ping period once joined
    pub ping_interval: Duration,
    /// Time allowed for a `pong` before the connection is declared dead
    pub pong_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(3000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 5,
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (zero-based): `base * 2^attempt`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    pub reconnect: ReconnectPolicy,
    /// Give up on a single connection attempt after this long
    pub connect_timeout: Duration,
    /// Idle time after the last keystroke before `typing_stop` is sent
    pub typing_idle: Duration,
    /// Events buffered for the application
    pub event_capacity: usize,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            typing_idle: Duration::from_secs(2),
            event_capacity: 256,
        }
    }
}
