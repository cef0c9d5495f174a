use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{KvmeshError, KvmeshResult};
use crate::types::{ConflictStrategy, TransportKind};

/// Top-level configuration (loaded from kvmesh.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KvmeshConfig {
    pub daemon: DaemonConfig,
    pub relay: RelayConfig,
    pub sync: SyncConfig,
}

impl KvmeshConfig {
    /// Parse a config file. Missing sections fall back to defaults.
    pub fn load(path: &Path) -> KvmeshResult<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| KvmeshError::Config(format!("parsing {}: {e}", path.display())))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// TCP listen address for the websocket relay
    pub listen: String,
    /// Per-room fan-out buffer (frames a slow client may lag behind)
    pub room_capacity: usize,
}

/// Replication settings for one coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Fixed peer id (default: generated per process)
    pub id: Option<String>,
    /// Transports to open, in order
    pub transports: Vec<TransportKind>,
    /// Conflict resolution strategy
    pub strategy: ConflictStrategy,
    /// Socket transport heartbeat period in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Base reconnect delay in milliseconds (doubled per attempt)
    pub reconnect_delay_ms: u64,
    /// Reconnect attempts before a socket transport gives up
    pub max_reconnect_attempts: u32,
    /// Room shared by broadcast, socket and signaling channels
    pub room_id: Option<String>,
    /// Relay websocket endpoint, e.g. ws://127.0.0.1:8787/ws
    pub socket_url: Option<String>,
    /// Signaling websocket endpoint, e.g. ws://127.0.0.1:8787/signal
    pub signaling_url: Option<String>,
    /// Upper bound on the peer signaling handshake
    pub signaling_timeout_ms: u64,
    /// Local address the offering side of a peer link listens on
    pub peer_bind_addr: String,
    /// Peers not heard from within this window are not counted in status
    pub peer_timeout_ms: u64,
}

impl SyncConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn signaling_timeout(&self) -> Duration {
        Duration::from_millis(self.signaling_timeout_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn room(&self) -> &str {
        self.room_id.as_deref().unwrap_or("default")
    }

    /// Check settings that cannot be expressed by the type alone.
    pub fn validate(&self) -> KvmeshResult<()> {
        if self.transports.contains(&TransportKind::Socket) && self.socket_url.is_none() {
            return Err(KvmeshError::Config(
                "socket transport requires socket_url".into(),
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(KvmeshError::Config(
                "heartbeat_interval_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8787".into(),
            room_capacity: 1024,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            id: None,
            transports: vec![TransportKind::Broadcast],
            strategy: ConflictStrategy::LastWriteWins,
            heartbeat_interval_ms: 30_000,
            reconnect_delay_ms: 1_000,
            max_reconnect_attempts: 5,
            room_id: Some("default".into()),
            socket_url: None,
            signaling_url: None,
            signaling_timeout_ms: 10_000,
            peer_bind_addr: "127.0.0.1:0".into(),
            peer_timeout_ms: 90_000,
        }
    }
}
