//! Shared agent state: session secrets learned during authentication and
//! the observable status surface.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use burrow_crypto::{NodeId, SessionBox, SessionKeypair, SigningKeypair};
use parking_lot::Mutex;

use crate::config::{TcpConfig, Timing};
use crate::node::Node;

/// Immutable context shared by the pool and every connection.
pub(crate) struct AgentContext {
    pub node: Arc<dyn Node>,
    /// Ephemeral session keypair, one per agent run.
    pub session_keys: SessionKeypair,
    /// Key signing the published peer record.
    pub peer_keys: SigningKeypair,

    pub server_id: NodeId,
    pub server_addr: SocketAddr,
    pub server_name: String,
    pub upstream_addr: SocketAddr,
    pub upstream_name: String,
    pub domain_name: Option<String>,
    pub max_connections: usize,

    pub tcp: TcpConfig,
    pub timing: Timing,

    /// Session secrets, set exactly once by the first AUTH acknowledgement.
    session: Mutex<Option<SessionAuth>>,
    pub status: Arc<AgentStatus>,
}

/// Secrets and facts learned from the first AUTH acknowledgement. Later
/// connections attach with these; they are never overwritten.
#[derive(Clone)]
pub(crate) struct SessionAuth {
    pub server_session_pk: [u8; 32],
    pub session_box: SessionBox,
    pub relay_port: u16,
    pub domain_enabled: bool,
}

impl AgentContext {
    /// Current session secrets, if the pool has authenticated.
    pub fn session(&self) -> Option<SessionAuth> {
        self.session.lock().clone()
    }

    /// Record the AUTH outcome. The first writer wins; a repeated AUTH
    /// (which the pool serialisation should prevent) keeps the original
    /// secrets and reports `false`.
    pub fn store_session(&self, auth: SessionAuth) -> bool {
        let mut slot = self.session.lock();
        if slot.is_some() {
            return false;
        }
        self.status.set_relay_port(auth.relay_port);
        self.status.authenticated.store(true, Ordering::Relaxed);
        *slot = Some(auth);
        true
    }

    pub fn new(
        node: Arc<dyn Node>,
        peer_keys: SigningKeypair,
        server_id: NodeId,
        server_addr: SocketAddr,
        server_name: String,
        upstream_addr: SocketAddr,
        upstream_name: String,
        domain_name: Option<String>,
        max_connections: usize,
        tcp: TcpConfig,
        timing: Timing,
    ) -> Self {
        Self {
            node,
            session_keys: SessionKeypair::generate(),
            peer_keys,
            server_id,
            server_addr,
            server_name,
            upstream_addr,
            upstream_name,
            domain_name,
            max_connections,
            tcp,
            timing,
            session: Mutex::new(None),
            status: Arc::new(AgentStatus::default()),
        }
    }
}

const RELAY_PORT_UNSET: u32 = u32::MAX;

/// Lock-free status surface readable from any thread.
#[derive(Debug)]
pub struct AgentStatus {
    running: AtomicBool,
    authenticated: AtomicBool,
    relay_port: AtomicU32,
    /// Unix millis of the newest byte received from the server, pool-wide.
    idle_timestamp_ms: AtomicU64,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            relay_port: AtomicU32::new(RELAY_PORT_UNSET),
            idle_timestamp_ms: AtomicU64::new(0),
        }
    }
}

impl AgentStatus {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Relaxed)
    }

    /// Relay port assigned by the server; valid once authenticated.
    pub fn relay_port(&self) -> Option<u16> {
        match self.relay_port.load(Ordering::Relaxed) {
            RELAY_PORT_UNSET => None,
            port => Some(port as u16),
        }
    }

    fn set_relay_port(&self, port: u16) {
        self.relay_port.store(u32::from(port), Ordering::Relaxed);
    }

    /// Unix millis of the newest server activity across the pool.
    pub fn idle_timestamp_ms(&self) -> u64 {
        self.idle_timestamp_ms.load(Ordering::Relaxed)
    }

    pub(crate) fn record_activity(&self, unix_ms: u64) {
        self.idle_timestamp_ms.fetch_max(unix_ms, Ordering::Relaxed);
    }
}

/// Current time as unix millis, for the status surface.
pub(crate) fn unix_millis_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
