//! Node identities and challenge signing.
//!
//! A node identity is its ed25519 public key; the 32 raw bytes double as the
//! identifier on the wire and as the lookup key in the surrounding peer
//! index.

use std::fmt;

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::ZeroizeOnDrop;

use crate::CryptoError;

/// Identity width in bytes.
pub const ID_BYTES: usize = 32;
/// Detached ed25519 signature width.
pub const SIGNATURE_BYTES: usize = 64;

/// A 32-byte node identifier (an ed25519 public key).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; ID_BYTES]);

impl NodeId {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    /// Parse an id from a byte slice of exactly [`ID_BYTES`].
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; ID_BYTES] =
            slice
                .try_into()
                .map_err(|_| CryptoError::InvalidLength {
                    what: "node id",
                    expected: ID_BYTES,
                    actual: slice.len(),
                })?;
        Ok(Self(bytes))
    }

    /// Parse an id from its 64-character hex form.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidHex)?;
        Self::from_slice(&bytes)
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// XOR distance to another id, as used by the surrounding peer index.
    #[must_use]
    pub fn distance(&self, other: &NodeId) -> [u8; ID_BYTES] {
        let mut out = [0u8; ID_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Verify a detached signature made by this identity.
    pub fn verify(&self, message: &[u8], signature: &[u8; SIGNATURE_BYTES]) -> Result<(), CryptoError> {
        let vk = VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)?;
        vk.verify(message, &ed25519_dalek::Signature::from_bytes(signature))
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Abbreviated form for logs; to_hex() gives the full id.
        write!(f, "{}..", hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

/// An ed25519 signing keypair: the node identity or a published peer key.
#[derive(Clone, ZeroizeOnDrop)]
pub struct SigningKeypair {
    secret: SigningKey,
}

impl SigningKeypair {
    /// Generate a fresh keypair from the OS RNG.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            secret: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild a keypair from its 32-byte seed.
    #[must_use]
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            secret: SigningKey::from_bytes(seed),
        }
    }

    /// The 32-byte seed, for persistence.
    #[must_use]
    pub fn to_seed(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// The public identity for this keypair.
    #[must_use]
    pub fn id(&self) -> NodeId {
        NodeId(self.secret.verifying_key().to_bytes())
    }

    /// Produce a detached signature over `message`.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_BYTES] {
        self.secret.sign(message).to_bytes()
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.secret
    }
}

impl fmt::Debug for SigningKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeypair").field("id", &self.id()).finish()
    }
}
