//! Session keypair and the symmetric session box.
//!
//! One x25519 keypair is generated per agent run and shared by every relay
//! connection; the box is derived once the server's session public key is
//! learned from the first AUTH acknowledgement.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::CryptoError;

/// Session public key width.
pub const SESSION_KEY_BYTES: usize = 32;
/// Session box nonce width (XChaCha20-Poly1305 extended nonce).
pub const NONCE_BYTES: usize = 24;
/// Poly1305 authentication tag width.
pub const MAC_BYTES: usize = 16;

/// Key-derivation context for the session box.
const SESSION_BOX_CONTEXT: &str = "burrow v1 session box key";

/// A 24-byte session box nonce.
///
/// Chosen uniformly at random once per relay connection during AUTH/ATTACH
/// and fixed for that connection's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_BYTES]);

impl Nonce {
    /// Draw a random nonce from the OS RNG.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; NONCE_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; NONCE_BYTES] =
            slice
                .try_into()
                .map_err(|_| CryptoError::InvalidLength {
                    what: "nonce",
                    expected: NONCE_BYTES,
                    actual: slice.len(),
                })?;
        Ok(Self(bytes))
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; NONCE_BYTES] {
        &self.0
    }
}

/// Ephemeral x25519 keypair shared by all connections of one pool run.
pub struct SessionKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl SessionKeypair {
    /// Generate a fresh keypair from the OS RNG.
    #[must_use]
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    #[must_use]
    pub fn public_bytes(&self) -> [u8; SESSION_KEY_BYTES] {
        self.public.to_bytes()
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

impl std::fmt::Debug for SessionKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeypair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish()
    }
}

/// Symmetric AEAD context shared by all connections of one pool run.
///
/// Ciphertext is `plaintext + MAC_BYTES` long; the nonce travels inside the
/// AUTH/ATTACH payload, never with the data packets themselves.
#[derive(Clone)]
pub struct SessionBox {
    cipher: XChaCha20Poly1305,
}

impl SessionBox {
    /// Derive the box from our session secret and the peer's session public
    /// key. Both sides arrive at the same key.
    pub fn new(
        local: &SessionKeypair,
        peer_pk: &[u8; SESSION_KEY_BYTES],
    ) -> Result<Self, CryptoError> {
        let shared = local.secret().diffie_hellman(&PublicKey::from(*peer_pk));
        if !shared.was_contributory() {
            return Err(CryptoError::WeakSharedSecret);
        }
        let key = blake3::derive_key(SESSION_BOX_CONTEXT, shared.as_bytes());
        Ok(Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(&key)),
        })
    }

    /// Encrypt `plain`, appending the authentication tag.
    pub fn encrypt(&self, plain: &[u8], nonce: &Nonce) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .encrypt(XNonce::from_slice(nonce.as_bytes()), plain)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt and authenticate `cipher`.
    pub fn decrypt(&self, cipher: &[u8], nonce: &Nonce) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .decrypt(XNonce::from_slice(nonce.as_bytes()), cipher)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for SessionBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionBox")
    }
}
