//! VeilNet Configuration
//!
//! Configuration options for VeilNet clients and relays. Stored as JSON,
//! durations in humantime notation (`"5m"`, `"30s"`).

use crate::{VeilError, VeilResult, DEFAULT_CIRCUIT_LENGTH, MAX_CIRCUIT_LENGTH};
use crate::crypto::keys::{DEFAULT_RSA_BITS, MAX_RSA_BITS, MIN_RSA_BITS};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// VeilNet configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VeilConfig {
    /// Node mode (client, relay, or both)
    pub mode: NodeMode,

    /// Data directory for keys and directory files
    pub data_dir: PathBuf,

    /// SOCKS5 listen address (client and bridge modes)
    pub socks_addr: Option<SocketAddr>,

    /// Relay listen address (relay and bridge modes)
    pub listen_addr: Option<SocketAddr>,

    /// Relay directory JSON (defaults to `<data_dir>/directory.json`)
    pub directory_file: Option<PathBuf>,

    /// Hidden-service records JSON (defaults to `<data_dir>/hidden_services.json`)
    pub hidden_services_file: Option<PathBuf>,

    /// Circuit settings
    pub circuit: CircuitConfig,

    /// Relay settings (if running as relay)
    pub relay: RelayConfig,

    /// Logging level
    pub log_level: String,
}

impl Default for VeilConfig {
    fn default() -> Self {
        Self {
            mode: NodeMode::Client,
            data_dir: default_data_dir(),
            socks_addr: Some(SocketAddr::from(([127, 0, 0, 1], 9050))),
            listen_addr: None,
            directory_file: None,
            hidden_services_file: None,
            circuit: CircuitConfig::default(),
            relay: RelayConfig::default(),
            log_level: "info".into(),
        }
    }
}

impl VeilConfig {
    /// Create client-only configuration
    pub fn client() -> Self {
        Self::default()
    }

    /// Create relay configuration
    pub fn relay(listen_addr: SocketAddr) -> Self {
        Self {
            mode: NodeMode::Relay,
            socks_addr: None,
            listen_addr: Some(listen_addr),
            ..Self::default()
        }
    }

    /// Create configuration for running both client and relay
    pub fn bridge(listen_addr: SocketAddr) -> Self {
        Self {
            mode: NodeMode::Bridge,
            listen_addr: Some(listen_addr),
            ..Self::default()
        }
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> VeilResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            VeilError::InvalidConfiguration(format!("{}: {}", path.display(), e))
        })?;

        serde_json::from_str(&content)
            .map_err(|e| VeilError::InvalidConfiguration(format!("{}: {}", path.display(), e)))
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> VeilResult<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| VeilError::InvalidConfiguration(e.to_string()))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> VeilResult<()> {
        if self.mode.runs_relay() && self.listen_addr.is_none() {
            return Err(VeilError::MissingConfiguration(
                "listen address required for relay mode".into(),
            ));
        }

        if self.mode.runs_client() && self.socks_addr.is_none() {
            return Err(VeilError::MissingConfiguration(
                "SOCKS address required for client mode".into(),
            ));
        }

        self.circuit.validate()?;
        self.relay.validate()?;

        if self.log_level.trim().is_empty() {
            return Err(VeilError::InvalidConfiguration("empty log level".into()));
        }

        Ok(())
    }

    /// Create the data directory if missing
    pub fn prepare_data_dir(&self) -> VeilResult<()> {
        std::fs::create_dir_all(&self.data_dir).map_err(|e| {
            VeilError::InvalidConfiguration(format!(
                "cannot create data dir {}: {}",
                self.data_dir.display(),
                e
            ))
        })
    }

    pub fn directory_path(&self) -> PathBuf {
        self.directory_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("directory.json"))
    }

    pub fn hidden_services_path(&self) -> PathBuf {
        self.hidden_services_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("hidden_services.json"))
    }

    pub fn key_path(&self) -> PathBuf {
        self.relay
            .key_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("relay_key.pem"))
    }
}

/// Node operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    /// Client only (SOCKS front end)
    Client,
    /// Relay only (forwards traffic)
    Relay,
    /// Both client and relay
    Bridge,
}

impl NodeMode {
    pub fn runs_client(self) -> bool {
        matches!(self, NodeMode::Client | NodeMode::Bridge)
    }

    pub fn runs_relay(self) -> bool {
        matches!(self, NodeMode::Relay | NodeMode::Bridge)
    }
}

/// Circuit configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Number of hops in circuits
    pub hops: usize,

    /// Maximum concurrently open streams per circuit
    pub max_streams: usize,

    /// Buffered events per stream subscription
    pub stream_buffer: usize,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            hops: DEFAULT_CIRCUIT_LENGTH,
            max_streams: 500,
            stream_buffer: 64,
        }
    }
}

impl CircuitConfig {
    pub fn validate(&self) -> VeilResult<()> {
        if self.hops == 0 || self.hops > MAX_CIRCUIT_LENGTH {
            return Err(VeilError::InvalidCircuitLength(self.hops, MAX_CIRCUIT_LENGTH));
        }
        if self.max_streams == 0 || self.max_streams > u16::MAX as usize - 1 {
            return Err(VeilError::InvalidConfiguration(format!(
                "max_streams must be between 1 and {}",
                u16::MAX - 1
            )));
        }
        if self.stream_buffer == 0 {
            return Err(VeilError::InvalidConfiguration(
                "stream_buffer must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Relay configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay nickname
    pub nickname: String,

    /// Idle time after which circuit state is evicted
    #[serde(with = "humantime_serde")]
    pub idle_ttl: Duration,

    /// PKCS#8 PEM private key (defaults to `<data_dir>/relay_key.pem`)
    pub key_file: Option<PathBuf>,

    /// Modulus size used when generating a key
    pub key_bits: usize,

    /// Where an empty CONNECT is sent ("host:port" of the hosted service)
    pub hidden_service_target: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            nickname: "unnamed".into(),
            idle_ttl: Duration::from_secs(300),
            key_file: None,
            key_bits: DEFAULT_RSA_BITS,
            hidden_service_target: None,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> VeilResult<()> {
        if self.nickname.is_empty() || self.nickname.len() > 32 {
            return Err(VeilError::InvalidConfiguration(
                "nickname must be 1-32 characters".into(),
            ));
        }
        if self.idle_ttl.is_zero() {
            return Err(VeilError::InvalidConfiguration(
                "idle_ttl must be positive".into(),
            ));
        }
        if !(MIN_RSA_BITS..=MAX_RSA_BITS).contains(&self.key_bits) {
            return Err(VeilError::InvalidConfiguration(format!(
                "key_bits must be between {} and {}",
                MIN_RSA_BITS, MAX_RSA_BITS
            )));
        }
        if let Some(target) = &self.hidden_service_target {
            if target.rsplit_once(':').is_none() {
                return Err(VeilError::InvalidConfiguration(format!(
                    "hidden_service_target {:?} is not host:port",
                    target
                )));
            }
        }
        Ok(())
    }
}

/// Get default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("veilnet"))
        .unwrap_or_else(|| PathBuf::from(".veilnet"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = VeilConfig::default();
        assert_eq!(config.mode, NodeMode::Client);
        assert!(config.socks_addr.is_some());
        config.validate().unwrap();
    }

    #[test]
    fn test_relay_config() {
        let addr: SocketAddr = "0.0.0.0:9001".parse().unwrap();
        let config = VeilConfig::relay(addr);
        assert_eq!(config.mode, NodeMode::Relay);
        assert_eq!(config.listen_addr, Some(addr));
        config.validate().unwrap();

        let mut missing = config.clone();
        missing.listen_addr = None;
        assert!(matches!(
            missing.validate(),
            Err(VeilError::MissingConfiguration(_))
        ));
    }

    #[test]
    fn test_bridge_needs_both() {
        let mut config = VeilConfig::bridge("127.0.0.1:9001".parse().unwrap());
        config.validate().unwrap();
        config.socks_addr = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_values() {
        let mut config = VeilConfig::default();
        config.circuit.hops = 0;
        assert!(matches!(
            config.validate(),
            Err(VeilError::InvalidCircuitLength(0, _))
        ));

        let mut config = VeilConfig::default();
        config.relay.idle_ttl = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = VeilConfig::default();
        config.relay.key_bits = 4096;
        assert!(config.validate().is_err());

        let mut config = VeilConfig::default();
        config.relay.hidden_service_target = Some("no-port".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_save_load() {
        let tmp = tempdir().unwrap();
        let config_path = tmp.path().join("nested").join("config.json");

        let mut config = VeilConfig::relay("127.0.0.1:9001".parse().unwrap());
        config.relay.idle_ttl = Duration::from_secs(90);
        config.relay.hidden_service_target = Some("127.0.0.1:8080".into());
        config.save(&config_path).unwrap();

        let raw = std::fs::read_to_string(&config_path).unwrap();
        assert!(raw.contains("\"1m 30s\""));

        let loaded = VeilConfig::load(&config_path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"mode":"relay","listen_addr":"127.0.0.1:9001"}"#).unwrap();

        let config = VeilConfig::load(&path).unwrap();
        assert_eq!(config.mode, NodeMode::Relay);
        assert_eq!(config.circuit.hops, DEFAULT_CIRCUIT_LENGTH);
        assert_eq!(config.relay.idle_ttl, Duration::from_secs(300));
    }

    #[test]
    fn test_derived_paths() {
        let mut config = VeilConfig::default();
        config.data_dir = PathBuf::from("/tmp/veil");
        assert_eq!(config.directory_path(), PathBuf::from("/tmp/veil/directory.json"));
        assert_eq!(config.key_path(), PathBuf::from("/tmp/veil/relay_key.pem"));

        config.relay.key_file = Some(PathBuf::from("/keys/r.pem"));
        assert_eq!(config.key_path(), PathBuf::from("/keys/r.pem"));
    }

    #[test]
    fn test_load_missing() {
        let tmp = tempdir().unwrap();
        assert!(matches!(
            VeilConfig::load(&tmp.path().join("nope.json")),
            Err(VeilError::InvalidConfiguration(_))
        ));
    }
}
