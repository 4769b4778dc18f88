//! Node-to-node sealed box.
//!
//! Seals a payload between two node identities by converting their ed25519
//! keys to x25519 (birational map) and running the same AEAD as the session
//! box. The nonce is derived from the XOR distance between the two ids, so
//! both directions of a pair share one deterministic nonce and nothing
//! nonce-shaped appears on the wire. Only handshake payloads travel through
//! this box, and each carries fresh random content.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::VerifyingKey;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::identity::{NodeId, SigningKeypair};
use crate::session::{Nonce, NONCE_BYTES};
use crate::CryptoError;

/// Key-derivation context for the node seal.
const NODE_BOX_CONTEXT: &str = "burrow v1 node box key";
/// Nonce-derivation context, keyed off the pair distance.
const NODE_NONCE_CONTEXT: &str = "burrow v1 node box nonce";

/// Sealed-box context between the local node and one remote identity.
#[derive(Clone)]
pub struct NodeBox {
    cipher: XChaCha20Poly1305,
    nonce: Nonce,
}

impl NodeBox {
    /// Build the pair context from our identity keys and the remote id.
    ///
    /// # Errors
    /// - `InvalidPublicKey` if the remote id is not a valid ed25519 point.
    /// - `WeakSharedSecret` if the exchange degenerates.
    pub fn new(local: &SigningKeypair, remote: &NodeId) -> Result<Self, CryptoError> {
        let remote_vk = VerifyingKey::from_bytes(remote.as_bytes())
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        let remote_x = PublicKey::from(remote_vk.to_montgomery().to_bytes());
        let local_x = StaticSecret::from(local.signing_key().to_scalar_bytes());

        let shared = local_x.diffie_hellman(&remote_x);
        if !shared.was_contributory() {
            return Err(CryptoError::WeakSharedSecret);
        }
        let key = blake3::derive_key(NODE_BOX_CONTEXT, shared.as_bytes());

        let distance = local.id().distance(remote);
        let digest = blake3::derive_key(NODE_NONCE_CONTEXT, &distance);
        let mut nonce = [0u8; NONCE_BYTES];
        nonce.copy_from_slice(&digest[..NONCE_BYTES]);

        Ok(Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(&key)),
            nonce: Nonce::from_bytes(nonce),
        })
    }

    /// Seal `plain` to the remote node. Output is `plain + MAC_BYTES` long.
    pub fn seal(&self, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .encrypt(XNonce::from_slice(self.nonce.as_bytes()), plain)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Open a payload sealed by the remote node.
    pub fn open(&self, cipher: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .decrypt(XNonce::from_slice(self.nonce.as_bytes()), cipher)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for NodeBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("NodeBox")
    }
}
