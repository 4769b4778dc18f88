//! Active reverse-tunnel agent.
//!
//! The agent dials out to a rendezvous server, proves its node identity by
//! signing the server's challenge, and keeps a pool of authenticated TCP
//! sessions over which the server relays inbound client connections to a
//! local upstream service. On the first successful authentication it
//! publishes a peer record (server, assigned relay port, optional domain)
//! through the surrounding node.
//!
//! ```ignore
//! let node = Arc::new(StandaloneNode::new(keys, Some(endpoint)));
//! let agent = Agent::start(node, config).await?;
//! // ...
//! agent.stop().await?;
//! ```

pub mod cli;
pub mod config;
mod announce;
mod connection;
mod error;
mod net;
mod node;
mod pool;
mod state;

pub use config::{load_agent_config, AgentConfig, AgentSettings};
pub use error::{AgentError, NodeError};
pub use node::{Node, PeerEndpoint, PeerInfo, StandaloneNode};
pub use state::AgentStatus;

use std::sync::Arc;

use burrow_crypto::{NodeId, SigningKeypair};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Timing;
use crate::net::resolve_sockaddr;
use crate::pool::Pool;
use crate::state::AgentContext;

/// Handle to a running agent.
///
/// Dropping the handle does not stop the worker; call [`Agent::stop`] for a
/// clean drain.
pub struct Agent {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    ctx: Arc<AgentContext>,
}

impl Agent {
    /// Resolve endpoints, spawn the pool supervisor and dispatch the first
    /// connection attempt.
    ///
    /// Resolves once the initial dispatch has happened; reaching an
    /// authenticated session is the reconnect loop's job, not start's.
    ///
    /// # Errors
    /// Configuration and resolution problems fail here; transient network
    /// failure does not.
    pub async fn start(node: Arc<dyn Node>, config: AgentConfig) -> Result<Agent, AgentError> {
        let settings = &config.agent;
        settings.validate()?;

        let server_id = NodeId::from_hex(&settings.server_peer_id)
            .map_err(|_| AgentError::Config("invalid server_peer_id".into()))?;

        let endpoint = match (&settings.server_host, settings.server_port) {
            (Some(host), Some(port)) => PeerEndpoint {
                host: host.clone(),
                port,
            },
            _ => node
                .lookup_peer(&server_id)
                .await?
                .ok_or_else(|| AgentError::ServerNotFound(server_id.to_hex()))?,
        };

        let server_name = format!("{}:{}", endpoint.host, endpoint.port);
        let server_addr = resolve_sockaddr(&server_name).await?;
        let upstream_name = settings.upstream_endpoint();
        let upstream_addr = resolve_sockaddr(&upstream_name).await?;

        let peer_keys = match &settings.peer_private_key {
            Some(hex_seed) => {
                let seed: [u8; 32] = hex::decode(hex_seed)
                    .ok()
                    .and_then(|bytes| bytes.try_into().ok())
                    .ok_or_else(|| {
                        AgentError::Config("peer_private_key must be 64 hex characters".into())
                    })?;
                SigningKeypair::from_seed(&seed)
            }
            None => SigningKeypair::generate(),
        };

        let ctx = Arc::new(AgentContext::new(
            node,
            peer_keys,
            server_id,
            server_addr,
            server_name.clone(),
            upstream_addr,
            upstream_name.clone(),
            settings.domain_name.clone(),
            settings.max_connections,
            settings.tcp.clone(),
            Timing::from(&settings.timing),
        ));

        info!(
            server = %server_name,
            upstream = %upstream_name,
            max_connections = settings.max_connections,
            "starting agent"
        );

        let cancel = CancellationToken::new();
        let mut pool = Pool::new(ctx.clone(), cancel.clone());
        pool.spawn_connection();
        ctx.status.set_running(true);
        let task = tokio::spawn(pool.run());

        Ok(Agent { cancel, task, ctx })
    }

    /// Stop the agent: cancel all timers and connections, then wait for
    /// every handle to drain.
    pub async fn stop(self) -> Result<(), AgentError> {
        info!("stopping agent");
        self.cancel.cancel();
        self.task.await.map_err(|_| AgentError::Worker)?;
        Ok(())
    }

    /// True while the pool supervisor is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.ctx.status.is_running()
    }

    /// True once the first AUTH has completed.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.ctx.status.is_authenticated()
    }

    /// Relay port assigned by the server; `None` until authenticated.
    #[must_use]
    pub fn relay_port(&self) -> Option<u16> {
        self.ctx.status.relay_port()
    }

    /// The rendezvous server endpoint, as resolved at start.
    #[must_use]
    pub fn server_endpoint(&self) -> &str {
        &self.ctx.server_name
    }

    /// The upstream service endpoint.
    #[must_use]
    pub fn upstream_endpoint(&self) -> &str {
        &self.ctx.upstream_name
    }

    /// Unix millis of the newest byte received from the server, pool-wide.
    #[must_use]
    pub fn idle_timestamp_ms(&self) -> u64 {
        self.ctx.status.idle_timestamp_ms()
    }
}
