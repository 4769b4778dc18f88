//! Cryptographic primitives for the burrow agent.
//!
//! Two encryption variants exist on the wire:
//!
//! - the **session box** ([`SessionBox`]): a symmetric XChaCha20-Poly1305
//!   context derived from the agent's ephemeral x25519 session keypair and
//!   the server's session public key, used for all data-plane payloads with
//!   an explicit 24-byte nonce;
//! - the **node seal** ([`NodeBox`]): the same AEAD keyed through the two
//!   parties' ed25519 identities (converted to x25519), with a nonce derived
//!   from the XOR distance between the identities. Used only while
//!   authenticating.
//!
//! Neither variant puts the nonce on the wire; ciphertext is always
//! `plaintext + MAC_BYTES` long.

mod error;
mod identity;
mod seal;
mod session;

pub use error::CryptoError;
pub use identity::{NodeId, SigningKeypair, ID_BYTES, SIGNATURE_BYTES};
pub use seal::NodeBox;
pub use session::{Nonce, SessionBox, SessionKeypair, MAC_BYTES, NONCE_BYTES, SESSION_KEY_BYTES};
