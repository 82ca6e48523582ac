//! Onion Encryption
//!
//! Layered AES-256-GCM with counter-derived nonces.
//!
//! # Design
//!
//! Each layer uses AES-256-GCM with:
//! - 256-bit per-hop key delivered in EXTEND
//! - 96-bit nonce derived from the hop's base nonce and a message counter
//! - No associated data
//!
//! # Layer Order
//!
//! ```text
//! multi_seal:  seal(K3) -> seal(K2) -> seal(K1)     (K1 outermost)
//! multi_open:  open(K1) -> open(K2) -> open(K3)
//! ```
//!
//! Counters are only advanced once every layer has succeeded, so a failed
//! open leaves the hop ready to retry the same nonce.

use super::keys::HopKeys;
use super::nonce::{derive_nonce, MessageClass, NonceCounters};
use super::{KEY_SIZE, NONCE_SIZE};
use crate::{VeilError, VeilResult};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use zeroize::Zeroize;

/// Symmetric layer cipher used for onion encryption
pub trait OnionCrypto: Send + Sync {
    /// Seal one layer
    fn seal(
        &self,
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        plaintext: &[u8],
    ) -> VeilResult<Vec<u8>>;

    /// Open one layer. Fails on tampering, wrong key or wrong nonce.
    fn open(
        &self,
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
    ) -> VeilResult<Vec<u8>>;

    /// Seal for every hop, last hop innermost
    fn multi_seal(
        &self,
        hops: &mut [HopCrypto],
        class: MessageClass,
        plaintext: &[u8],
    ) -> VeilResult<Vec<u8>> {
        let nonces = hops
            .iter()
            .map(|hop| hop.peek_nonce(class))
            .collect::<VeilResult<Vec<_>>>()?;

        let mut data = plaintext.to_vec();
        for (hop, nonce) in hops.iter().zip(&nonces).rev() {
            data = self.seal(hop.keys.key(), nonce, &data)?;
        }

        for hop in hops.iter_mut() {
            hop.counters.commit(class)?;
        }
        Ok(data)
    }

    /// Open every hop's layer, first hop first
    fn multi_open(
        &self,
        hops: &mut [HopCrypto],
        class: MessageClass,
        ciphertext: &[u8],
    ) -> VeilResult<Vec<u8>> {
        let mut data = ciphertext.to_vec();
        for hop in hops.iter() {
            let nonce = hop.peek_nonce(class)?;
            data = self.open(hop.keys.key(), &nonce, &data)?;
        }

        for hop in hops.iter_mut() {
            hop.counters.commit(class)?;
        }
        Ok(data)
    }
}

/// AES-256-GCM layer cipher
#[derive(Debug, Clone, Copy, Default)]
pub struct AeadOnion;

impl AeadOnion {
    pub fn new() -> Self {
        Self
    }

    fn cipher(key: &[u8; KEY_SIZE]) -> VeilResult<Aes256Gcm> {
        Aes256Gcm::new_from_slice(key).map_err(|e| VeilError::InvalidKey(e.to_string()))
    }
}

impl OnionCrypto for AeadOnion {
    fn seal(
        &self,
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        plaintext: &[u8],
    ) -> VeilResult<Vec<u8>> {
        Self::cipher(key)?
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|e| VeilError::EncryptionFailed(e.to_string()))
    }

    fn open(
        &self,
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
    ) -> VeilResult<Vec<u8>> {
        Self::cipher(key)?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| VeilError::DecryptionFailed)
    }
}

/// One hop's keys together with its nonce counters
#[derive(Debug, Clone)]
pub struct HopCrypto {
    keys: HopKeys,
    counters: NonceCounters,
}

impl HopCrypto {
    pub fn new(keys: HopKeys) -> Self {
        Self {
            keys,
            counters: NonceCounters::new(),
        }
    }

    pub fn keys(&self) -> &HopKeys {
        &self.keys
    }

    pub fn counters(&self) -> &NonceCounters {
        &self.counters
    }

    /// Nonce the next message of `class` will use
    pub fn peek_nonce(&self, class: MessageClass) -> VeilResult<[u8; NONCE_SIZE]> {
        let counter = self.counters.peek(class)?;
        Ok(derive_nonce(self.keys.base_nonce(), class, counter))
    }

    /// Seal one layer, consuming a nonce
    pub fn seal(
        &mut self,
        crypto: &dyn OnionCrypto,
        class: MessageClass,
        plaintext: &[u8],
    ) -> VeilResult<Vec<u8>> {
        let nonce = self.peek_nonce(class)?;
        let sealed = crypto.seal(self.keys.key(), &nonce, plaintext)?;
        self.counters.commit(class)?;
        Ok(sealed)
    }

    /// Trial-open one layer. The nonce is consumed only on success.
    pub fn try_open(
        &mut self,
        crypto: &dyn OnionCrypto,
        class: MessageClass,
        ciphertext: &[u8],
    ) -> VeilResult<Vec<u8>> {
        let nonce = self.peek_nonce(class)?;
        let opened = crypto.open(self.keys.key(), &nonce, ciphertext)?;
        self.counters.commit(class)?;
        Ok(opened)
    }

    /// Zero the key material
    pub fn wipe(&mut self) {
        self.keys.zeroize();
    }

    #[cfg(test)]
    pub(crate) fn counters_mut(&mut self) -> &mut NonceCounters {
        &mut self.counters
    }
}
