//! VeilNet: a minimal onion-routing overlay
//!
//! A client telescopically builds a multi-hop encrypted circuit through
//! relay nodes, then tunnels logical connections through that circuit to a
//! TCP destination or to a hidden service hosted behind a pinned exit relay.
//!
//! # Architecture
//!
//! VeilNet is layered the following way (leaves first):
//!
//! 1. **Cell Layer** - Fixed 512-byte cells, prefixed on the wire by a
//!    16-byte circuit id ([`cell`], [`payload`])
//! 2. **Crypto Layer** - Per-hop AES-256-GCM layers with counter-derived
//!    nonces, RSA-wrapped hop keys ([`crypto`])
//! 3. **Circuit Layer** - Client-side circuit aggregate and the telescoping
//!    build protocol ([`circuit`], [`builder`])
//! 4. **Relay Layer** - Per-circuit relay state and the cell-dispatch state
//!    machine ([`conn_state`], [`dispatch`], [`server`])
//! 5. **Front End** - Client facade and a SOCKS5 listener ([`client`], [`socks`])
//!
//! # Example
//!
//! ```ignore
//! use veilnet::prelude::*;
//!
//! let client = VeilClient::new(config.circuit.clone(), relays, circuits, hidden);
//! let circuit_id = client.build_circuit(3, None).await?;
//! let stream_id = client.open_stream(circuit_id)?;
//! let mut events = client.subscribe(circuit_id, stream_id)?;
//! client.send_begin(circuit_id, stream_id, "example.com:80").await?;
//! ```

pub mod builder;
pub mod cell;
pub mod circuit;
pub mod client;
pub mod config;
pub mod conn_state;
pub mod crypto;
pub mod dispatch;
pub mod error;
pub mod hidden;
pub mod payload;
pub mod relay;
pub mod repository;
pub mod server;
pub mod socks;
pub mod transport;

pub use builder::CircuitBuilder;
pub use cell::{Cell, Command, Frame};
pub use circuit::{Circuit, CircuitId, StreamId};
pub use client::{StreamEvent, VeilClient};
pub use config::VeilConfig;
pub use conn_state::{ConnState, ConnStateTable};
pub use crypto::{AeadOnion, OnionCrypto};
pub use dispatch::{CellDispatcher, RelayDispatch};
pub use error::{VeilError, VeilResult};
pub use hidden::HiddenAddress;
pub use relay::{RelayDescriptor, RelayId};
pub use server::RelayServer;

/// Prelude for common imports
pub mod prelude {
    pub use crate::{
        Cell, Circuit, CircuitBuilder, CircuitId, Command, Frame, HiddenAddress, RelayDescriptor,
        RelayId, RelayServer, StreamEvent, StreamId, VeilClient, VeilConfig, VeilError,
        VeilResult,
    };
    pub use crate::crypto::keys::RelayKeyPair;
    pub use crate::repository::{
        CircuitRepository, HiddenServiceRepository, InMemoryCircuitRepository,
        InMemoryHiddenServiceRepository, InMemoryRelayRepository, RelayRepository,
    };
}

/// Protocol version carried in every cell header
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of an encoded cell (bytes)
pub const CELL_SIZE: usize = 512;

/// Cell header: command(1) + version(1) + length(2)
pub const CELL_HEADER_SIZE: usize = 4;

/// Largest payload a single cell can carry
pub const MAX_PAYLOAD_SIZE: usize = CELL_SIZE - CELL_HEADER_SIZE;

/// Raw circuit id prefix in front of every cell
pub const CIRCUIT_ID_SIZE: usize = 16;

/// Size of a full wire frame (circuit id + cell)
pub const FRAME_SIZE: usize = CIRCUIT_ID_SIZE + CELL_SIZE;

/// Default circuit length (hops)
pub const DEFAULT_CIRCUIT_LENGTH: usize = 3;

/// Maximum circuit length
pub const MAX_CIRCUIT_LENGTH: usize = 8;

/// Bytes each onion layer adds (AEAD tag)
pub const LAYER_OVERHEAD: usize = 16;

/// Stream data an exit relay reads from a destination per DATA cell.
///
/// Sized so the cell still fits after every relay of the longest allowed
/// circuit has added its layer.
pub const EXIT_READ_CHUNK: usize =
    MAX_PAYLOAD_SIZE - MAX_CIRCUIT_LENGTH * LAYER_OVERHEAD - payload::DATA_HEADER_SIZE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(CELL_SIZE, 512);
        assert_eq!(MAX_PAYLOAD_SIZE, 508);
        assert_eq!(FRAME_SIZE, 528);
        assert_eq!(EXIT_READ_CHUNK, 376);
    }
}
