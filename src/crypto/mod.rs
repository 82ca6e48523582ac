//! VeilNet Cryptographic Layer
//!
//! Onion encryption with AES-256-GCM and RSA-OAEP wrapped hop keys.
//!
//! # Key Distribution
//!
//! The client generates a fresh [`HopKeys`] (256-bit key + 96-bit base
//! nonce) for every hop and ships it inside EXTEND, wrapped under the
//! relay's long-term RSA public key. Hop keys only ever live in memory.
//!
//! # Onion Layers
//!
//! Each hop adds a layer of encryption:
//! ```text
//! Client -> R1 -> R2 -> R3 -> Destination
//!   |       |     |     |
//!   +-- K1 -+     |     |     (outermost layer)
//!   +------ K2 ---+     |     (middle layer)
//!   +----------- K3 ----+     (innermost layer)
//! ```
//!
//! # Nonces
//!
//! Each hop keeps three counters, one per [`MessageClass`]. The nonce for a
//! message is the hop's base nonce with the counter folded in, so sender and
//! receiver stay in lock step without sending nonces on the wire.

pub mod keys;
pub mod nonce;
pub mod onion;

pub use keys::{unwrap_hop_keys, wrap_hop_keys, HopKeys, RelayKeyPair};
pub use nonce::{derive_nonce, MessageClass, NonceCounters};
pub use onion::{AeadOnion, HopCrypto, OnionCrypto};

use sha2::{Digest, Sha256};

/// AES-256 key size
pub const KEY_SIZE: usize = 32;

/// AES-GCM nonce size
pub const NONCE_SIZE: usize = 12;

/// Generate random bytes
pub fn random_bytes<const N: usize>() -> [u8; N] {
    use rand::RngCore;
    let mut bytes = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

/// SHA-256 fingerprint of data
pub fn fingerprint(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}
