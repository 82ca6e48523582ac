//! Relay Descriptors
//!
//! What a client knows about a relay: identity, address and public key.
//! Descriptors are read from a JSON directory file; the `id` is the SHA-256
//! of the relay's PKCS#1 DER public key, so a descriptor can be checked
//! against the key it carries.

use crate::crypto::keys::{public_key_from_der, RelayKeyPair};
use crate::crypto::fingerprint;
use crate::{VeilError, VeilResult};
use rsa::RsaPublicKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::net::SocketAddr;

/// Unique relay identifier (SHA-256 of the public key)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelayId([u8; 32]);

impl RelayId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Identity of the relay holding this PKCS#1 DER public key
    pub fn from_public_key_der(der: &[u8]) -> Self {
        Self(fingerprint(der))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> VeilResult<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut bytes)
            .map_err(|e| VeilError::InvalidConfiguration(format!("relay id {:?}: {}", s, e)))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Display for RelayId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.to_hex()[..16]) // Short form
    }
}

impl Serialize for RelayId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RelayId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        RelayId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Hex encoding for byte fields in JSON files
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.trim()).map_err(serde::de::Error::custom)
    }
}

fn default_online() -> bool {
    true
}

/// Relay descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayDescriptor {
    /// Unique relay identifier
    pub id: RelayId,

    /// Relay nickname
    pub nickname: String,

    /// Address relays and clients dial
    pub address: SocketAddr,

    /// PKCS#1 DER public key
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,

    /// Only online relays are selected for circuits
    #[serde(default = "default_online")]
    pub online: bool,
}

impl RelayDescriptor {
    /// Build a descriptor for a local key pair
    pub fn from_key_pair(
        keys: &RelayKeyPair,
        nickname: impl Into<String>,
        address: SocketAddr,
    ) -> VeilResult<Self> {
        Ok(Self::from_public_key(nickname, address, keys.public_key_der()?))
    }

    /// Build a descriptor from a relay's PKCS#1 DER public key
    pub fn from_public_key(
        nickname: impl Into<String>,
        address: SocketAddr,
        public_key: Vec<u8>,
    ) -> Self {
        Self {
            id: RelayId::from_public_key_der(&public_key),
            nickname: nickname.into(),
            address,
            public_key,
            online: true,
        }
    }

    /// Parsed RSA public key
    pub fn rsa_public_key(&self) -> VeilResult<RsaPublicKey> {
        public_key_from_der(&self.public_key)
    }

    /// Check that `id` matches the carried key and the key parses
    pub fn validate(&self) -> VeilResult<()> {
        if RelayId::from_public_key_der(&self.public_key) != self.id {
            return Err(VeilError::RelayKeyMismatch(self.nickname.clone()));
        }
        self.rsa_public_key().map(|_| ())
    }
}
