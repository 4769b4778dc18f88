//! Crypto error types.

/// Errors produced by the crypto primitives.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("AEAD encryption failed")]
    EncryptionFailed,

    #[error("AEAD authentication failed")]
    DecryptionFailed,

    #[error("key exchange produced a non-contributory shared secret")]
    WeakSharedSecret,

    #[error("invalid public key bytes")]
    InvalidPublicKey,

    #[error("invalid {what} length: expected {expected}, got {actual}")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid hex encoding")]
    InvalidHex,
}
