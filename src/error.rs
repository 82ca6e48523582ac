//! Error types for VeilNet
//!
//! One error enum for the whole crate, grouped by the layer that raises it.
//! The classification helpers at the bottom encode how each group is handled:
//! protocol errors drop the connection, topology errors surface to the caller,
//! everything else is scoped to the cell or stream that caused it.

use crate::circuit::CircuitId;
use thiserror::Error;

/// Result type for VeilNet operations
pub type VeilResult<T> = Result<T, VeilError>;

/// VeilNet error types
#[derive(Debug, Error)]
pub enum VeilError {
    // ========== Cell Errors ==========

    /// Frame or cell of the wrong size
    #[error("Invalid cell size: expected {expected} bytes, got {actual}")]
    InvalidCellSize { expected: usize, actual: usize },

    /// Payload larger than a cell can carry
    #[error("Cell payload too large: {0} bytes (max {1})")]
    CellTooLarge(usize, usize),

    /// Unknown command byte
    #[error("Unknown cell command: {0:#04x}")]
    UnknownCommand(u8),

    /// Malformed payload sub-encoding
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    // ========== Crypto Errors ==========

    /// Sealing a layer failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// AEAD authentication failed
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Invalid key material
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// RSA wrap/unwrap of hop keys failed
    #[error("Key wrapping failed: {0}")]
    KeyWrapFailed(String),

    /// A nonce counter reached its maximum
    #[error("Nonce counter exhausted")]
    NonceExhausted,

    // ========== Circuit Errors ==========

    /// Circuit not found
    #[error("Circuit not found: {0}")]
    CircuitNotFound(CircuitId),

    /// Fewer online relays than requested hops
    #[error("Not enough online relays: requested {requested}, available {available}")]
    NotEnoughRelays { requested: usize, available: usize },

    /// Invalid circuit length
    #[error("Invalid circuit length: {0} hops (allowed 1..={1})")]
    InvalidCircuitLength(usize, usize),

    /// Circuit build aborted
    #[error("Circuit build failed: {0}")]
    CircuitBuildFailed(String),

    /// Circuit not usable in its current state
    #[error("Invalid circuit state: {0}")]
    InvalidCircuitState(String),

    /// Circuit was destroyed
    #[error("Circuit closed")]
    CircuitClosed,

    // ========== Stream Errors ==========

    /// Stream not found
    #[error("Stream not found: {0}")]
    StreamNotFound(u16),

    /// Stream closed
    #[error("Stream closed: {0}")]
    StreamClosed(u16),

    /// Every non-reserved stream id is in use
    #[error("Stream limit reached for circuit {0}")]
    StreamLimitReached(CircuitId),

    /// Exit relay refused or failed the stream
    #[error("Stream {0} rejected by exit: {1}")]
    StreamRejected(u16, String),

    // ========== Relay Errors ==========

    /// Relay not found
    #[error("Relay not found: {0}")]
    RelayNotFound(String),

    /// CREATED acknowledgement carried an unexpected key
    #[error("Relay key mismatch for {0}")]
    RelayKeyMismatch(String),

    /// Hidden service not found
    #[error("Hidden service not found: {0}")]
    HiddenServiceNotFound(String),

    /// Invalid address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    // ========== Protocol Errors ==========

    /// Cell not valid in the current circuit phase
    #[error("Unexpected cell: {0}")]
    UnexpectedCell(String),

    /// Protocol version mismatch
    #[error("Protocol version mismatch: expected {0}, got {1}")]
    ProtocolVersionMismatch(u8, u8),

    // ========== Network Errors ==========

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Dialing a relay or destination failed
    #[error("Dial to {addr} failed: {reason}")]
    DialFailed { addr: String, reason: String },

    /// Peer closed the connection
    #[error("Connection closed")]
    ConnectionClosed,

    // ========== Configuration Errors ==========

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Missing configuration
    #[error("Missing configuration: {0}")]
    MissingConfiguration(String),

    // ========== Internal Errors ==========

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl VeilError {
    /// Malformed traffic: the connection that produced it is dropped
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            VeilError::InvalidCellSize { .. }
                | VeilError::CellTooLarge(..)
                | VeilError::UnknownCommand(_)
                | VeilError::InvalidPayload(_)
                | VeilError::ProtocolVersionMismatch(..)
        )
    }

    /// Path-selection and lookup failures surfaced to the caller
    pub fn is_topology_error(&self) -> bool {
        matches!(
            self,
            VeilError::NotEnoughRelays { .. }
                | VeilError::CircuitNotFound(_)
                | VeilError::RelayNotFound(_)
                | VeilError::HiddenServiceNotFound(_)
        )
    }

    /// Whether building a fresh circuit could get past this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            VeilError::DialFailed { .. }
                | VeilError::ConnectionClosed
                | VeilError::CircuitClosed
                | VeilError::CircuitBuildFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VeilError::CellTooLarge(600, 508);
        assert_eq!(err.to_string(), "Cell payload too large: 600 bytes (max 508)");

        let err = VeilError::NotEnoughRelays { requested: 3, available: 1 };
        assert_eq!(err.to_string(), "Not enough online relays: requested 3, available 1");
    }

    #[test]
    fn test_classification() {
        assert!(VeilError::UnknownCommand(0x42).is_protocol_error());
        assert!(!VeilError::DecryptionFailed.is_protocol_error());

        assert!(VeilError::NotEnoughRelays { requested: 2, available: 0 }.is_topology_error());
        assert!(!VeilError::ConnectionClosed.is_topology_error());

        assert!(VeilError::ConnectionClosed.is_recoverable());
        assert!(!VeilError::InvalidAddress("x".into()).is_recoverable());
    }
}
