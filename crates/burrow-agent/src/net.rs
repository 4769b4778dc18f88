//! Address resolution and socket tuning.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::config::TcpConfig;
use crate::error::AgentError;

/// Resolve a string address (host:port) to a `SocketAddr`.
///
/// Prefers an IPv4 result when both families resolve, matching the
/// relay server deployments this agent talks to.
pub(crate) async fn resolve_sockaddr(target: &str) -> Result<SocketAddr, AgentError> {
    if let Ok(addr) = target.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(target)
        .await
        .map_err(|_| AgentError::Resolve(target.to_string()))?
        .collect();
    if let Some(v4) = addrs.iter().find(|a| a.is_ipv4()) {
        return Ok(*v4);
    }
    addrs
        .into_iter()
        .next()
        .ok_or_else(|| AgentError::Resolve(target.to_string()))
}

/// Apply TCP socket options.
pub(crate) fn apply_tcp_options(stream: &TcpStream, config: &TcpConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.no_delay)?;

    if config.keepalive_secs > 0 {
        let sock = socket2::SockRef::from(stream);
        let keepalive =
            socket2::TcpKeepalive::new().with_time(Duration::from_secs(config.keepalive_secs));
        sock.set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}
