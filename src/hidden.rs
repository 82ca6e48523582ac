//! Hidden Services
//!
//! A hidden service is a TCP service reachable only through a pinned exit
//! relay. Its address is derived from the service's public key:
//!
//! ```text
//! base32(sha256("veilnet-hidden-service-v1" || pkcs1_der)) + ".veil"
//! ```
//!
//! Clients resolve an address to a [`HiddenServiceRecord`], build a circuit
//! whose last hop is the record's exit, and send an empty CONNECT.

use crate::relay::{hex_bytes, RelayId};
use crate::{VeilError, VeilResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Hidden address suffix
pub const HIDDEN_SUFFIX: &str = ".veil";

/// Length of the base32 part of an address (32 bytes, 5 bits per char)
pub const ADDRESS_CHARS: usize = 52;

const ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Hidden service address (`<base32>.veil`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HiddenAddress([u8; 32]);

impl HiddenAddress {
    /// Derive from a PKCS#1 DER public key
    pub fn from_public_key(der: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"veilnet-hidden-service-v1");
        hasher.update(der);
        Self(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether `host` looks like a hidden address
    pub fn is_hidden_host(host: &str) -> bool {
        host.trim().to_ascii_lowercase().ends_with(HIDDEN_SUFFIX)
    }

    /// Parse `<base32>.veil`
    pub fn parse(s: &str) -> VeilResult<Self> {
        let s = s.trim().to_ascii_lowercase();
        let encoded = s
            .strip_suffix(HIDDEN_SUFFIX)
            .ok_or_else(|| VeilError::InvalidAddress(format!("{}: missing {} suffix", s, HIDDEN_SUFFIX)))?;

        if encoded.len() != ADDRESS_CHARS {
            return Err(VeilError::InvalidAddress(format!(
                "{}: expected {} characters, got {}",
                s,
                ADDRESS_CHARS,
                encoded.len()
            )));
        }

        let mut bytes = [0u8; 32];
        let mut buffer: u64 = 0;
        let mut bits = 0;
        let mut idx = 0;

        for c in encoded.bytes() {
            let value = ALPHABET
                .iter()
                .position(|&x| x == c)
                .ok_or_else(|| VeilError::InvalidAddress(format!("invalid character {:?}", c as char)))?;

            buffer = (buffer << 5) | value as u64;
            bits += 5;

            if bits >= 8 {
                bits -= 8;
                if idx < bytes.len() {
                    bytes[idx] = (buffer >> bits) as u8;
                }
                idx += 1;
            }
        }

        // 52 chars carry 260 bits; the 4 spare bits must be zero
        if buffer & ((1 << bits) - 1) != 0 {
            return Err(VeilError::InvalidAddress(format!("{}: non-canonical encoding", s)));
        }

        Ok(Self(bytes))
    }
}

impl std::fmt::Display for HiddenAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut out = String::with_capacity(ADDRESS_CHARS + HIDDEN_SUFFIX.len());
        let mut buffer: u64 = 0;
        let mut bits = 0;

        for byte in &self.0 {
            buffer = (buffer << 8) | *byte as u64;
            bits += 8;

            while bits >= 5 {
                bits -= 5;
                out.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
            }
        }

        if bits > 0 {
            out.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
        }

        out.push_str(HIDDEN_SUFFIX);
        f.write_str(&out)
    }
}

impl std::str::FromStr for HiddenAddress {
    type Err = VeilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for HiddenAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HiddenAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        HiddenAddress::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Where a hidden service is hosted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiddenServiceRecord {
    pub address: HiddenAddress,
    /// Exit relay hosting the service
    pub exit: RelayId,
    /// Service's PKCS#1 DER public key
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
}

impl HiddenServiceRecord {
    pub fn new(public_key: Vec<u8>, exit: RelayId) -> Self {
        Self {
            address: HiddenAddress::from_public_key(&public_key),
            exit,
            public_key,
        }
    }

    /// Whether the address really belongs to the carried key
    pub fn is_consistent(&self) -> bool {
        HiddenAddress::from_public_key(&self.public_key) == self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_format() {
        let addr = HiddenAddress::from_public_key(b"some public key");
        let s = addr.to_string();
        assert!(s.ends_with(".veil"));
        assert_eq!(s.len(), ADDRESS_CHARS + HIDDEN_SUFFIX.len());
        assert!(s[..ADDRESS_CHARS]
            .bytes()
            .all(|c| ALPHABET.contains(&c)));
    }

    #[test]
    fn test_address_parse() {
        let addr = HiddenAddress::from_public_key(b"another key");
        let parsed = HiddenAddress::parse(&addr.to_string()).unwrap();
        assert_eq!(parsed, addr);

        let upper = addr.to_string().to_uppercase();
        assert_eq!(HiddenAddress::parse(&upper).unwrap(), addr);
    }

    #[test]
    fn test_address_parse_errors() {
        assert!(HiddenAddress::parse("example.com").is_err());
        assert!(HiddenAddress::parse("abc.veil").is_err());

        let mut s = HiddenAddress::from_bytes([0u8; 32]).to_string();
        s.replace_range(0..1, "1");
        assert!(HiddenAddress::parse(&s).is_err());
    }

    #[test]
    fn test_is_hidden_host() {
        assert!(HiddenAddress::is_hidden_host("abc.veil"));
        assert!(HiddenAddress::is_hidden_host("ABC.VEIL"));
        assert!(!HiddenAddress::is_hidden_host("example.com"));
    }

    #[test]
    fn test_record_json() {
        let exit = RelayId::from_bytes([3u8; 32]);
        let record = HiddenServiceRecord::new(b"service key".to_vec(), exit);
        assert!(record.is_consistent());

        let json = serde_json::to_string(&record).unwrap();
        let parsed: HiddenServiceRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }
}
