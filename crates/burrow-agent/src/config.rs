//! Agent configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use burrow_core::defaults;
use serde::Deserialize;

use crate::error::AgentError;

/// Top-level agent configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub agent: AgentSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Core agent settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSettings {
    /// Rendezvous server node id (64 hex chars). Used for sealed crypto and
    /// to look the server up in the peer index.
    pub server_peer_id: String,

    /// Direct server endpoint, for deployments without a peer index
    /// (skips the lookup when both are set).
    pub server_host: Option<String>,
    pub server_port: Option<u16>,

    /// Local service to relay inbound connections to.
    pub upstream_host: String,
    pub upstream_port: u16,

    /// Hex seed of the key signing the published peer record.
    /// Generated fresh when absent.
    pub peer_private_key: Option<String>,

    /// Domain advertised to the server; honoured only if the server's
    /// AUTH acknowledgement allows it.
    pub domain_name: Option<String>,

    /// Maximum number of pooled relay sessions.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Path of the node identity seed file (hex). Created when missing.
    pub identity_file: Option<PathBuf>,

    /// TCP socket options for the relay connection.
    #[serde(default)]
    pub tcp: TcpConfig,

    /// Protocol timing knobs. The defaults are the wire-protocol values;
    /// tests shrink them.
    #[serde(default)]
    pub timing: TimingConfig,
}

fn default_max_connections() -> usize {
    defaults::DEFAULT_MAX_CONNECTIONS
}

/// TCP socket options.
#[derive(Debug, Clone, Deserialize)]
pub struct TcpConfig {
    /// Disable Nagle's algorithm.
    #[serde(default = "default_no_delay")]
    pub no_delay: bool,
    /// SO_KEEPALIVE idle time in seconds (0 = disabled).
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            no_delay: default_no_delay(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

fn default_no_delay() -> bool {
    defaults::DEFAULT_TCP_NO_DELAY
}

fn default_keepalive_secs() -> u64 {
    defaults::DEFAULT_TCP_KEEPALIVE_SECS
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Base level: trace, debug, info, warn, error.
    pub level: Option<String>,
    /// Output format: pretty, compact, json.
    pub format: Option<String>,
    /// Output stream: stderr, stdout.
    pub output: Option<String>,
    /// Per-module level overrides.
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
}

/// Protocol timing knobs, all in milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "d_keep_alive_interval")]
    pub keep_alive_interval_ms: u64,
    #[serde(default = "d_keep_alive_check")]
    pub keep_alive_check_interval_ms: u64,
    #[serde(default = "d_keep_alive_retry")]
    pub max_keep_alive_retry: u32,
    #[serde(default = "d_reconnect_min")]
    pub reconnect_min_ms: u64,
    #[serde(default = "d_reconnect_max")]
    pub reconnect_max_ms: u64,
    #[serde(default = "d_idle_check")]
    pub idle_check_interval_ms: u64,
    #[serde(default = "d_stalled_handshake")]
    pub stalled_handshake_ms: u64,
    #[serde(default = "d_write_queue")]
    pub relay_write_queue_bytes: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval_ms: d_keep_alive_interval(),
            keep_alive_check_interval_ms: d_keep_alive_check(),
            max_keep_alive_retry: d_keep_alive_retry(),
            reconnect_min_ms: d_reconnect_min(),
            reconnect_max_ms: d_reconnect_max(),
            idle_check_interval_ms: d_idle_check(),
            stalled_handshake_ms: d_stalled_handshake(),
            relay_write_queue_bytes: d_write_queue(),
        }
    }
}

fn d_keep_alive_interval() -> u64 {
    defaults::DEFAULT_KEEP_ALIVE_INTERVAL_MS
}
fn d_keep_alive_check() -> u64 {
    defaults::DEFAULT_KEEP_ALIVE_CHECK_INTERVAL_MS
}
fn d_keep_alive_retry() -> u32 {
    defaults::DEFAULT_MAX_KEEP_ALIVE_RETRY
}
fn d_reconnect_min() -> u64 {
    defaults::DEFAULT_RECONNECT_MIN_MS
}
fn d_reconnect_max() -> u64 {
    defaults::DEFAULT_RECONNECT_MAX_MS
}
fn d_idle_check() -> u64 {
    defaults::DEFAULT_IDLE_CHECK_INTERVAL_MS
}
fn d_stalled_handshake() -> u64 {
    defaults::DEFAULT_STALLED_HANDSHAKE_MS
}
fn d_write_queue() -> usize {
    defaults::DEFAULT_RELAY_WRITE_QUEUE_SIZE
}

/// Resolved timing values used by the pool and connections.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub keep_alive_interval: Duration,
    pub keep_alive_check_interval: Duration,
    pub max_keep_alive_retry: u32,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    pub idle_check_interval: Duration,
    pub stalled_handshake: Duration,
    pub relay_write_queue_bytes: usize,
}

impl Timing {
    /// Silence bound after which a connection is declared dead.
    #[must_use]
    pub fn dead_after(&self) -> Duration {
        self.keep_alive_interval * self.max_keep_alive_retry
    }
}

impl From<&TimingConfig> for Timing {
    fn from(cfg: &TimingConfig) -> Self {
        Self {
            keep_alive_interval: Duration::from_millis(cfg.keep_alive_interval_ms),
            keep_alive_check_interval: Duration::from_millis(cfg.keep_alive_check_interval_ms),
            max_keep_alive_retry: cfg.max_keep_alive_retry,
            reconnect_min: Duration::from_millis(cfg.reconnect_min_ms),
            reconnect_max: Duration::from_millis(cfg.reconnect_max_ms),
            idle_check_interval: Duration::from_millis(cfg.idle_check_interval_ms),
            stalled_handshake: Duration::from_millis(cfg.stalled_handshake_ms),
            relay_write_queue_bytes: cfg.relay_write_queue_bytes,
        }
    }
}

impl AgentSettings {
    /// Validate fields that cannot be checked by serde alone.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.server_peer_id.len() != 64
            || !self.server_peer_id.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(AgentError::Config(
                "server_peer_id must be 64 hex characters".into(),
            ));
        }
        if self.upstream_host.is_empty() {
            return Err(AgentError::Config("upstream_host must not be empty".into()));
        }
        if self.upstream_port == 0 {
            return Err(AgentError::Config("upstream_port must not be zero".into()));
        }
        if self.max_connections == 0 {
            return Err(AgentError::Config("max_connections must be at least 1".into()));
        }
        if let Some(domain) = &self.domain_name {
            if domain.len() > 255 {
                return Err(AgentError::Config("domain_name exceeds 255 bytes".into()));
            }
        }
        if self.server_host.is_some() != self.server_port.is_some() {
            return Err(AgentError::Config(
                "server_host and server_port must be set together".into(),
            ));
        }
        Ok(())
    }

    /// Display form of the upstream endpoint.
    #[must_use]
    pub fn upstream_endpoint(&self) -> String {
        format!("{}:{}", self.upstream_host, self.upstream_port)
    }
}

/// Load agent configuration from a file path.
///
/// Supports TOML and JSON formats (detected by extension).
pub fn load_agent_config(path: &Path) -> Result<AgentConfig, AgentError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| AgentError::Config(format!("failed to read config: {e}")))?;

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    let config: AgentConfig = match ext {
        "json" => serde_json::from_str(&content)
            .map_err(|e| AgentError::Config(format!("JSON parse error: {e}")))?,
        _ => toml::from_str(&content)
            .map_err(|e| AgentError::Config(format!("TOML parse error: {e}")))?,
    };

    config.agent.validate()?;
    Ok(config)
}
