//! Repositories
//!
//! Lookup tables the client and relays consult: the relay directory, the
//! client's live circuits and the hidden-service registry. Each is a trait
//! with an in-memory implementation; directory and hidden-service tables can
//! be loaded from (and saved to) JSON files.

use crate::circuit::{CircuitId, SharedCircuit};
use crate::hidden::{HiddenAddress, HiddenServiceRecord};
use crate::relay::{RelayDescriptor, RelayId};
use crate::{VeilError, VeilResult};
use parking_lot::RwLock;
use rsa::RsaPublicKey;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

/// Directory of known relays
pub trait RelayRepository: Send + Sync {
    /// Relays eligible for path selection
    fn online_relays(&self) -> Vec<RelayDescriptor>;

    fn find(&self, id: &RelayId) -> Option<RelayDescriptor>;

    fn public_key(&self, id: &RelayId) -> VeilResult<RsaPublicKey> {
        self.find(id)
            .ok_or_else(|| VeilError::RelayNotFound(id.to_hex()))?
            .rsa_public_key()
    }

    /// Insert or replace a descriptor
    fn upsert(&self, relay: RelayDescriptor);
}

/// Client-side circuit registry
pub trait CircuitRepository: Send + Sync {
    fn save(&self, circuit: SharedCircuit);

    fn find(&self, id: &CircuitId) -> Option<SharedCircuit>;

    fn delete(&self, id: &CircuitId) -> Option<SharedCircuit>;

    /// Ids of every registered circuit
    fn active(&self) -> Vec<CircuitId>;
}

/// Hidden-service address registry
pub trait HiddenServiceRepository: Send + Sync {
    fn find(&self, address: &HiddenAddress) -> Option<HiddenServiceRecord>;

    fn publish(&self, record: HiddenServiceRecord) -> VeilResult<()>;
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> VeilResult<T> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| {
        VeilError::InvalidConfiguration(format!("{}: {}", path.display(), e))
    })
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> VeilResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let content = serde_json::to_string_pretty(value)
        .map_err(|e| VeilError::Internal(format!("serialize {}: {}", path.display(), e)))?;
    std::fs::write(path, content)?;
    Ok(())
}

/// In-memory relay directory
#[derive(Debug, Default)]
pub struct InMemoryRelayRepository {
    relays: RwLock<HashMap<RelayId, RelayDescriptor>>,
}

impl InMemoryRelayRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_relays(relays: impl IntoIterator<Item = RelayDescriptor>) -> Self {
        let repo = Self::new();
        for relay in relays {
            repo.upsert(relay);
        }
        repo
    }

    /// Load a directory file (JSON array of descriptors). Descriptors whose
    /// id does not match their key are skipped.
    pub fn load_json(path: &Path) -> VeilResult<Self> {
        let relays: Vec<RelayDescriptor> = read_json(path)?;
        let total = relays.len();
        let repo = Self::with_relays(relays.into_iter().filter(|relay| {
            match relay.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!("Skipping relay {} in directory: {}", relay.nickname, e);
                    false
                }
            }
        }));
        debug!("Loaded {}/{} relays from {}", repo.len(), total, path.display());
        Ok(repo)
    }

    /// Write every descriptor as a JSON array, sorted by nickname
    pub fn save_json(&self, path: &Path) -> VeilResult<()> {
        let mut relays = self.all();
        relays.sort_by(|a, b| a.nickname.cmp(&b.nickname));
        write_json(path, &relays)
    }

    pub fn all(&self) -> Vec<RelayDescriptor> {
        self.relays.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.relays.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.read().is_empty()
    }

    /// Flip a relay's online flag; false if unknown
    pub fn set_online(&self, id: &RelayId, online: bool) -> bool {
        let mut relays = self.relays.write();
        match relays.get_mut(id) {
            Some(relay) => {
                relay.online = online;
                true
            }
            None => false,
        }
    }
}

impl RelayRepository for InMemoryRelayRepository {
    fn online_relays(&self) -> Vec<RelayDescriptor> {
        self.relays
            .read()
            .values()
            .filter(|relay| relay.online)
            .cloned()
            .collect()
    }

    fn find(&self, id: &RelayId) -> Option<RelayDescriptor> {
        self.relays.read().get(id).cloned()
    }

    fn upsert(&self, relay: RelayDescriptor) {
        self.relays.write().insert(relay.id, relay);
    }
}

/// In-memory circuit registry
#[derive(Default)]
pub struct InMemoryCircuitRepository {
    circuits: RwLock<HashMap<CircuitId, SharedCircuit>>,
}

impl InMemoryCircuitRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.circuits.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.circuits.read().is_empty()
    }
}

impl CircuitRepository for InMemoryCircuitRepository {
    fn save(&self, circuit: SharedCircuit) {
        let id = circuit.lock().id();
        self.circuits.write().insert(id, circuit);
    }

    fn find(&self, id: &CircuitId) -> Option<SharedCircuit> {
        self.circuits.read().get(id).cloned()
    }

    fn delete(&self, id: &CircuitId) -> Option<SharedCircuit> {
        self.circuits.write().remove(id)
    }

    fn active(&self) -> Vec<CircuitId> {
        self.circuits.read().keys().copied().collect()
    }
}

/// In-memory hidden-service registry
#[derive(Debug, Default)]
pub struct InMemoryHiddenServiceRepository {
    services: RwLock<HashMap<HiddenAddress, HiddenServiceRecord>>,
}

impl InMemoryHiddenServiceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON array of records
    pub fn load_json(path: &Path) -> VeilResult<Self> {
        let records: Vec<HiddenServiceRecord> = read_json(path)?;
        let repo = Self::new();
        for record in records {
            repo.publish(record)?;
        }
        Ok(repo)
    }

    pub fn save_json(&self, path: &Path) -> VeilResult<()> {
        let records: Vec<_> = self.services.read().values().cloned().collect();
        write_json(path, &records)
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }
}

impl HiddenServiceRepository for InMemoryHiddenServiceRepository {
    fn find(&self, address: &HiddenAddress) -> Option<HiddenServiceRecord> {
        self.services.read().get(address).cloned()
    }

    fn publish(&self, record: HiddenServiceRecord) -> VeilResult<()> {
        if !record.is_consistent() {
            return Err(VeilError::InvalidAddress(format!(
                "{} does not match its public key",
                record.address
            )));
        }
        self.services.write().insert(record.address, record);
        Ok(())
    }
}
