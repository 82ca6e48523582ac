//! Key Management
//!
//! Per-hop symmetric keys and the relay's long-term RSA identity.
//!
//! Hop keys travel inside EXTEND as `key(32) || base_nonce(12)` encrypted
//! with RSA-OAEP(SHA-256) under the relay's public key. Relay private keys
//! are stored as PKCS#8 PEM, public keys as PKCS#1 (DER on the wire, PEM on
//! disk).

use super::{random_bytes, KEY_SIZE, NONCE_SIZE};
use crate::relay::RelayId;
use crate::{VeilError, VeilResult};
use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::fmt;
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Serialized size of a [`HopKeys`]
pub const HOP_KEYS_SIZE: usize = KEY_SIZE + NONCE_SIZE;

/// Default RSA modulus size for relay identities
pub const DEFAULT_RSA_BITS: usize = 2048;

/// Smallest accepted RSA modulus
pub const MIN_RSA_BITS: usize = 1024;

/// Largest RSA modulus whose wrapped keys still fit in an EXTEND cell
pub const MAX_RSA_BITS: usize = 3072;

/// Symmetric key material for one hop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct HopKeys {
    key: [u8; KEY_SIZE],
    base_nonce: [u8; NONCE_SIZE],
}

impl HopKeys {
    /// Fresh random keys
    pub fn generate() -> Self {
        Self {
            key: random_bytes(),
            base_nonce: random_bytes(),
        }
    }

    pub fn from_parts(key: [u8; KEY_SIZE], base_nonce: [u8; NONCE_SIZE]) -> Self {
        Self { key, base_nonce }
    }

    /// Parse `key || base_nonce`
    pub fn from_bytes(bytes: &[u8]) -> VeilResult<Self> {
        if bytes.len() != HOP_KEYS_SIZE {
            return Err(VeilError::InvalidKey(format!(
                "hop keys must be {} bytes, got {}",
                HOP_KEYS_SIZE,
                bytes.len()
            )));
        }
        let mut keys = Self {
            key: [0u8; KEY_SIZE],
            base_nonce: [0u8; NONCE_SIZE],
        };
        keys.key.copy_from_slice(&bytes[..KEY_SIZE]);
        keys.base_nonce.copy_from_slice(&bytes[KEY_SIZE..]);
        Ok(keys)
    }

    /// Serialize as `key || base_nonce`
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(HOP_KEYS_SIZE));
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.base_nonce);
        out
    }

    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    pub fn base_nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.base_nonce
    }
}

impl fmt::Debug for HopKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HopKeys").finish_non_exhaustive()
    }
}

impl PartialEq for HopKeys {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.base_nonce == other.base_nonce
    }
}

impl Eq for HopKeys {}

/// Encrypt hop keys for a relay
pub fn wrap_hop_keys(public_key: &RsaPublicKey, keys: &HopKeys) -> VeilResult<Vec<u8>> {
    public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &keys.to_bytes())
        .map_err(|e| VeilError::KeyWrapFailed(e.to_string()))
}

/// Recover hop keys wrapped by [`wrap_hop_keys`]
pub fn unwrap_hop_keys(private_key: &RsaPrivateKey, blob: &[u8]) -> VeilResult<HopKeys> {
    let plain = Zeroizing::new(
        private_key
            .decrypt(Oaep::new::<Sha256>(), blob)
            .map_err(|e| VeilError::KeyWrapFailed(e.to_string()))?,
    );
    HopKeys::from_bytes(&plain)
}

/// Parse a PKCS#1 DER public key
pub fn public_key_from_der(der: &[u8]) -> VeilResult<RsaPublicKey> {
    RsaPublicKey::from_pkcs1_der(der).map_err(|e| VeilError::InvalidKey(e.to_string()))
}

/// Parse a PEM public key, PKCS#1 or SubjectPublicKeyInfo
pub fn public_key_from_pem(pem: &str) -> VeilResult<RsaPublicKey> {
    RsaPublicKey::from_pkcs1_pem(pem)
        .or_else(|_| RsaPublicKey::from_public_key_pem(pem))
        .map_err(|e| VeilError::InvalidKey(e.to_string()))
}

/// Encode a public key as PKCS#1 DER
pub fn public_key_to_der(key: &RsaPublicKey) -> VeilResult<Vec<u8>> {
    key.to_pkcs1_der()
        .map(|doc| doc.as_bytes().to_vec())
        .map_err(|e| VeilError::InvalidKey(e.to_string()))
}

/// Path of the public key written next to a private key file
pub fn public_key_path(private_path: &Path) -> PathBuf {
    let mut name = private_path.as_os_str().to_owned();
    name.push(".pub");
    PathBuf::from(name)
}

/// A relay's long-term RSA identity
#[derive(Clone)]
pub struct RelayKeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl RelayKeyPair {
    /// Generate a new key pair
    pub fn generate(bits: usize) -> VeilResult<Self> {
        if !(MIN_RSA_BITS..=MAX_RSA_BITS).contains(&bits) {
            return Err(VeilError::InvalidKey(format!(
                "RSA key size must be between {} and {} bits, got {}",
                MIN_RSA_BITS, MAX_RSA_BITS, bits
            )));
        }
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| VeilError::InvalidKey(e.to_string()))?;
        Ok(Self::from_private(private))
    }

    pub fn from_private(private: RsaPrivateKey) -> Self {
        let public = private.to_public_key();
        Self { private, public }
    }

    /// Load a PKCS#8 PEM private key
    pub fn load_pem(path: &Path) -> VeilResult<Self> {
        let pem = Zeroizing::new(std::fs::read_to_string(path)?);
        let private = RsaPrivateKey::from_pkcs8_pem(&pem)
            .map_err(|e| VeilError::InvalidKey(format!("{}: {}", path.display(), e)))?;

        let bits = private.size() * 8;
        if bits > MAX_RSA_BITS {
            return Err(VeilError::InvalidKey(format!(
                "{}: {}-bit keys are not supported (max {})",
                path.display(),
                bits,
                MAX_RSA_BITS
            )));
        }
        Ok(Self::from_private(private))
    }

    /// Write the private key (PKCS#8 PEM) to `path` and the public key
    /// (PKCS#1 PEM) to `path.pub`
    pub fn save_pem(&self, path: &Path) -> VeilResult<PathBuf> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let private_pem = self
            .private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| VeilError::InvalidKey(e.to_string()))?;
        std::fs::write(path, private_pem.as_bytes())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        let public_path = public_key_path(path);
        std::fs::write(&public_path, self.public_key_pem()?)?;
        Ok(public_path)
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// PKCS#1 DER public key, as carried in CREATED
    pub fn public_key_der(&self) -> VeilResult<Vec<u8>> {
        public_key_to_der(&self.public)
    }

    /// PKCS#1 PEM public key
    pub fn public_key_pem(&self) -> VeilResult<String> {
        self.public
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| VeilError::InvalidKey(e.to_string()))
    }

    /// Identity derived from the public key
    pub fn relay_id(&self) -> VeilResult<RelayId> {
        Ok(RelayId::from_public_key_der(&self.public_key_der()?))
    }

    /// Unwrap hop keys sent to this relay
    pub fn unwrap_hop_keys(&self, blob: &[u8]) -> VeilResult<HopKeys> {
        unwrap_hop_keys(&self.private, blob)
    }
}

impl fmt::Debug for RelayKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayKeyPair")
            .field("bits", &(self.public.size() * 8))
            .finish_non_exhaustive()
    }
}
