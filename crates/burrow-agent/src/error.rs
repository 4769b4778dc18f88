//! Agent error types.

use burrow_crypto::CryptoError;

/// Errors surfaced to the caller of the agent lifecycle.
///
/// Transient network failure is not represented here: connection-level
/// errors are absorbed by the pool's reconnect loop and only logged.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("address resolution failed for {0}")]
    Resolve(String),

    #[error("server peer {0} not found in the peer index")]
    ServerNotFound(String),

    #[error("node error: {0}")]
    Node(#[from] NodeError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("agent worker terminated abnormally")]
    Worker,
}

/// Errors produced by the surrounding node (DHT, sealed crypto, announcer).
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("peer lookup failed: {0}")]
    Lookup(String),

    #[error("peer announcement failed: {0}")]
    Announce(String),
}
