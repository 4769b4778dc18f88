//! Default configuration values.
//!
//! Centralized default constants for use across all crates.

// ============================================================================
// Keep-Alive Defaults
// ============================================================================

/// Interval of server silence after which an idling connection pings (ms).
pub const DEFAULT_KEEP_ALIVE_INTERVAL_MS: u64 = 60_000;
/// Keep-alive timer granularity (ms).
pub const DEFAULT_KEEP_ALIVE_CHECK_INTERVAL_MS: u64 = 5_000;
/// Missed keep-alive rounds before a connection is declared dead.
pub const DEFAULT_MAX_KEEP_ALIVE_RETRY: u32 = 3;

// ============================================================================
// Pool Defaults
// ============================================================================

/// Default maximum number of pooled relay sessions.
pub const DEFAULT_MAX_CONNECTIONS: usize = 8;
/// Initial reconnect backoff after a failed session (ms).
pub const DEFAULT_RECONNECT_MIN_MS: u64 = 1_000;
/// Reconnect backoff ceiling (ms).
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 60_000;
/// Pool idle-check timer period (ms).
pub const DEFAULT_IDLE_CHECK_INTERVAL_MS: u64 = 5_000;
/// How long a session may sit pre-idle before the pool force-closes it (ms).
pub const DEFAULT_STALLED_HANDSHAKE_MS: u64 = 120_000;
/// Consecutive upstream failures worth a loud warning.
pub const DEFAULT_UPSTREAM_FAIL_WARN: u32 = 3;

// ============================================================================
// Relay Buffer Defaults
// ============================================================================

/// Cap on bytes queued for write toward the server before upstream reads pause.
pub const DEFAULT_RELAY_WRITE_QUEUE_SIZE: usize = 2 * 1024 * 1024;
/// Upstream reads resume once the write queue drains below cap / RESUME_DIVISOR.
pub const RELAY_WRITE_RESUME_DIVISOR: usize = 4;

// ============================================================================
// TCP Socket Defaults
// ============================================================================

/// Default TCP_NODELAY (disable Nagle's algorithm for lower latency).
pub const DEFAULT_TCP_NO_DELAY: bool = true;
/// Default TCP Keep-Alive interval in seconds (0 = disabled).
pub const DEFAULT_TCP_KEEPALIVE_SECS: u64 = 300;
