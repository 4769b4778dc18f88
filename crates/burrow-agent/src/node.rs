//! Interface to the surrounding node: identity crypto, peer index access
//! and peer announcement.
//!
//! The agent consumes the node through the [`Node`] trait so it can be
//! embedded into a full DHT node. [`StandaloneNode`] is the adapter for
//! deployments without a peer index: it owns a local identity and takes the
//! server endpoint from static configuration.

use std::collections::HashMap;

use async_trait::async_trait;
use burrow_crypto::{NodeBox, NodeId, SigningKeypair, SIGNATURE_BYTES};
use parking_lot::Mutex;
use tracing::info;

use crate::error::NodeError;

/// A host/port pair found in the peer index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub host: String,
    pub port: u16,
}

/// The peer record published after the first successful authentication.
#[derive(Clone)]
pub struct PeerInfo {
    /// Key the record is signed and looked up by.
    pub keypair: SigningKeypair,
    /// The rendezvous server's node id (the record's origin).
    pub server_id: NodeId,
    /// This agent's node id.
    pub node_id: NodeId,
    /// Relay port assigned by the server.
    pub port: u16,
    /// Advertised domain, when the server enabled it.
    pub domain: Option<String>,
}

impl PeerInfo {
    /// Identity the record is published under.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.keypair.id()
    }
}

impl std::fmt::Debug for PeerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerInfo")
            .field("id", &self.id())
            .field("server_id", &self.server_id)
            .field("port", &self.port)
            .field("domain", &self.domain)
            .finish()
    }
}

/// Operations the agent requires from the surrounding node.
#[async_trait]
pub trait Node: Send + Sync {
    /// This node's identity.
    fn id(&self) -> NodeId;

    /// Sign `message` with the node identity key.
    fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_BYTES];

    /// Seal `plain` to `recipient` (ciphertext is `plain + MAC` bytes;
    /// nonce handling is internal to the node).
    fn seal_to(&self, recipient: &NodeId, plain: &[u8]) -> Result<Vec<u8>, NodeError>;

    /// Open a payload sealed to us by `sender`.
    fn open_from(&self, sender: &NodeId, cipher: &[u8]) -> Result<Vec<u8>, NodeError>;

    /// Look up a peer's published endpoint in the surrounding index.
    async fn lookup_peer(&self, id: &NodeId) -> Result<Option<PeerEndpoint>, NodeError>;

    /// Publish a peer record, persistently re-announced by the node.
    async fn announce_peer(&self, info: PeerInfo, persistent: bool) -> Result<(), NodeError>;
}

/// Node adapter for deployments without a peer index.
pub struct StandaloneNode {
    keys: SigningKeypair,
    server: Option<PeerEndpoint>,
    seals: Mutex<HashMap<NodeId, NodeBox>>,
}

impl StandaloneNode {
    /// Build a standalone node from identity keys and an optional static
    /// server endpoint (used to answer `lookup_peer`).
    #[must_use]
    pub fn new(keys: SigningKeypair, server: Option<PeerEndpoint>) -> Self {
        Self {
            keys,
            server,
            seals: Mutex::new(HashMap::new()),
        }
    }

    fn pair_box(&self, peer: &NodeId) -> Result<NodeBox, NodeError> {
        let mut seals = self.seals.lock();
        if let Some(bx) = seals.get(peer) {
            return Ok(bx.clone());
        }
        let bx = NodeBox::new(&self.keys, peer)?;
        seals.insert(*peer, bx.clone());
        Ok(bx)
    }
}

#[async_trait]
impl Node for StandaloneNode {
    fn id(&self) -> NodeId {
        self.keys.id()
    }

    fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_BYTES] {
        self.keys.sign(message)
    }

    fn seal_to(&self, recipient: &NodeId, plain: &[u8]) -> Result<Vec<u8>, NodeError> {
        Ok(self.pair_box(recipient)?.seal(plain)?)
    }

    fn open_from(&self, sender: &NodeId, cipher: &[u8]) -> Result<Vec<u8>, NodeError> {
        Ok(self.pair_box(sender)?.open(cipher)?)
    }

    async fn lookup_peer(&self, _id: &NodeId) -> Result<Option<PeerEndpoint>, NodeError> {
        Ok(self.server.clone())
    }

    async fn announce_peer(&self, info: PeerInfo, _persistent: bool) -> Result<(), NodeError> {
        // No index to publish into; the record is only logged so operators
        // can register it out of band.
        info!(
            peer = %info.id(),
            server = %info.server_id,
            port = info.port,
            domain = info.domain.as_deref().unwrap_or(""),
            "standalone node: peer record not published"
        );
        Ok(())
    }
}
