//! Circuit Management
//!
//! Client-side view of a circuit: the ordered hops with their keys, the
//! stream table and the lifecycle state.
//!
//! # Circuit Lifecycle
//!
//! 1. **Building**: the builder extends the circuit hop by hop
//! 2. **Ready**: streams may be opened and data flows
//! 3. **Destroyed**: keys are wiped and every stream is closed
//!
//! Hop keys are zeroized when the circuit is wiped and again when it is
//! dropped.

use crate::crypto::{AeadOnion, HopCrypto, HopKeys, MessageClass, OnionCrypto};
use crate::payload::DATA_HEADER_SIZE;
use crate::relay::{RelayDescriptor, RelayId};
use crate::{VeilError, VeilResult, LAYER_OVERHEAD, MAX_PAYLOAD_SIZE};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Stream identifier, unique within a circuit
pub type StreamId = u16;

/// Stream 0 addresses the circuit itself and is never allocated
pub const CONTROL_STREAM: StreamId = 0;

/// Circuit shared between the client facade and its reader task
pub type SharedCircuit = Arc<Mutex<Circuit>>;

/// Largest DATA chunk that fits in one cell after `hops` layers
pub const fn max_stream_data(hops: usize) -> usize {
    MAX_PAYLOAD_SIZE - hops * LAYER_OVERHEAD - DATA_HEADER_SIZE
}

/// Unique circuit identifier (random UUID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CircuitId(Uuid);

impl CircuitId {
    /// Generate a new random id
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn parse(s: &str) -> VeilResult<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| VeilError::InvalidPayload(format!("circuit id: {}", e)))
    }
}

impl fmt::Display for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Per-circuit stream id counter. Wraps from `0xFFFF` to 1, never yields 0.
#[derive(Debug, Clone)]
pub struct StreamIdGenerator {
    next: StreamId,
}

impl StreamIdGenerator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next(&mut self) -> StreamId {
        let id = self.next;
        self.next = if id == StreamId::MAX { 1 } else { id + 1 };
        id
    }
}

impl Default for StreamIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit being built
    Building,
    /// Circuit ready for use
    Ready,
    /// Circuit destroyed
    Destroyed,
}

/// A VeilNet circuit
pub struct Circuit {
    id: CircuitId,
    state: CircuitState,
    path: Vec<RelayDescriptor>,
    layers: Vec<HopCrypto>,
    /// Open streams; closed ids are removed
    streams: HashSet<StreamId>,
    stream_ids: StreamIdGenerator,
    crypto: Arc<dyn OnionCrypto>,
    created_at: Instant,
    last_activity: Instant,
}

impl Circuit {
    /// Create a circuit in the `Building` state with AES-GCM layers
    pub fn new(id: CircuitId, hops: Vec<(RelayDescriptor, HopKeys)>) -> Self {
        Self::with_crypto(id, hops, Arc::new(AeadOnion::new()))
    }

    pub fn with_crypto(
        id: CircuitId,
        hops: Vec<(RelayDescriptor, HopKeys)>,
        crypto: Arc<dyn OnionCrypto>,
    ) -> Self {
        let (path, keys): (Vec<_>, Vec<_>) = hops.into_iter().unzip();
        let now = Instant::now();
        Self {
            id,
            state: CircuitState::Building,
            path,
            layers: keys.into_iter().map(HopCrypto::new).collect(),
            streams: HashSet::new(),
            stream_ids: StreamIdGenerator::new(),
            crypto,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn id(&self) -> CircuitId {
        self.id
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == CircuitState::Ready
    }

    pub fn hop_count(&self) -> usize {
        self.path.len()
    }

    /// Relays in path order (entry first)
    pub fn path(&self) -> &[RelayDescriptor] {
        &self.path
    }

    /// Keys for hop `index`, used when wrapping EXTEND
    pub fn hop_keys(&self, index: usize) -> Option<&HopKeys> {
        self.layers.get(index).map(HopCrypto::keys)
    }

    pub fn relay_ids(&self) -> Vec<RelayId> {
        self.path.iter().map(|relay| relay.id).collect()
    }

    /// Address the client dials
    pub fn entry_address(&self) -> Option<SocketAddr> {
        self.path.first().map(|relay| relay.address)
    }

    pub fn exit(&self) -> Option<&RelayDescriptor> {
        self.path.last()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Largest DATA chunk for this circuit
    pub fn max_stream_data(&self) -> usize {
        max_stream_data(self.path.len())
    }

    /// Building -> Ready
    pub fn mark_ready(&mut self) -> VeilResult<()> {
        if self.state != CircuitState::Building {
            return Err(VeilError::InvalidCircuitState(format!(
                "cannot mark {:?} circuit ready",
                self.state
            )));
        }
        self.state = CircuitState::Ready;
        self.last_activity = Instant::now();
        Ok(())
    }

    fn ensure_ready(&self) -> VeilResult<()> {
        match self.state {
            CircuitState::Ready => Ok(()),
            CircuitState::Destroyed => Err(VeilError::CircuitClosed),
            CircuitState::Building => Err(VeilError::InvalidCircuitState(
                "circuit is still building".into(),
            )),
        }
    }

    /// Allocate a stream id not currently open
    pub fn open_stream(&mut self) -> VeilResult<StreamId> {
        self.ensure_ready()?;

        for _ in 0..StreamId::MAX {
            let id = self.stream_ids.next();
            if self.streams.insert(id) {
                self.last_activity = Instant::now();
                return Ok(id);
            }
        }
        Err(VeilError::StreamLimitReached(self.id))
    }

    /// Open the control stream that carries CONNECT traffic
    pub fn bind_control_stream(&mut self) -> VeilResult<()> {
        self.ensure_ready()?;
        if self.is_stream_open(CONTROL_STREAM) {
            return Err(VeilError::InvalidCircuitState(
                "circuit already has a CONNECT destination".into(),
            ));
        }
        self.streams.insert(CONTROL_STREAM);
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Close a stream. Returns false if it was not open.
    pub fn close_stream(&mut self, stream_id: StreamId) -> bool {
        self.streams.remove(&stream_id)
    }

    pub fn is_stream_open(&self, stream_id: StreamId) -> bool {
        self.streams.contains(&stream_id)
    }

    pub fn open_streams(&self) -> Vec<StreamId> {
        let mut ids: Vec<_> = self.streams.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Largest plaintext that still fits one cell once every layer is added
    pub fn max_sealed_plaintext(&self) -> usize {
        MAX_PAYLOAD_SIZE - self.path.len() * LAYER_OVERHEAD
    }

    /// Onion-seal a payload for the exit. Oversized payloads are refused
    /// before any nonce is used.
    pub fn seal_downstream(&mut self, class: MessageClass, plaintext: &[u8]) -> VeilResult<Vec<u8>> {
        self.ensure_ready()?;
        let sealed_len = plaintext.len() + self.path.len() * LAYER_OVERHEAD;
        if sealed_len > MAX_PAYLOAD_SIZE {
            return Err(VeilError::CellTooLarge(sealed_len, MAX_PAYLOAD_SIZE));
        }
        let sealed = self.crypto.multi_seal(&mut self.layers, class, plaintext)?;
        self.last_activity = Instant::now();
        Ok(sealed)
    }

    /// Peel every layer off an upstream DATA payload
    pub fn open_upstream(&mut self, ciphertext: &[u8]) -> VeilResult<Vec<u8>> {
        self.ensure_ready()?;
        let opened = self
            .crypto
            .multi_open(&mut self.layers, MessageClass::UpstreamData, ciphertext)?;
        self.last_activity = Instant::now();
        Ok(opened)
    }

    /// Close every stream, zero the keys and mark the circuit destroyed
    pub fn wipe(&mut self) {
        self.streams.clear();
        for layer in self.layers.iter_mut() {
            layer.wipe();
        }
        self.state = CircuitState::Destroyed;
    }
}

impl fmt::Debug for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Circuit")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("path", &self.relay_ids())
            .field("open_streams", &self.open_streams().len())
            .finish()
    }
}
