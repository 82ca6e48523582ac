//! Per-hop nonce counters

use super::NONCE_SIZE;
use crate::{VeilError, VeilResult};

/// Which counter a message consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    /// BEGIN and CONNECT
    Begin,
    /// DATA travelling from the client toward the exit
    DownstreamData,
    /// DATA travelling from the exit toward the client
    UpstreamData,
}

impl MessageClass {
    fn index(self) -> usize {
        match self {
            MessageClass::Begin => 0,
            MessageClass::DownstreamData => 1,
            MessageClass::UpstreamData => 2,
        }
    }

    /// Tag folded into the first nonce byte; distinct per class
    fn tag(self) -> u8 {
        self.index() as u8 + 1
    }
}

/// Nonce for message `counter` of `class`: the class tag is folded into the
/// first byte of `base` and the counter into its low 8 bytes, so the three
/// counters of one hop never share a nonce under its key.
pub fn derive_nonce(base: &[u8; NONCE_SIZE], class: MessageClass, counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = *base;
    nonce[0] ^= class.tag();
    for (b, c) in nonce[4..].iter_mut().zip(counter.to_le_bytes()) {
        *b ^= c;
    }
    nonce
}

/// Three independent monotonic counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NonceCounters {
    values: [u64; 3],
}

impl NonceCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter
    pub fn get(&self, class: MessageClass) -> u64 {
        self.values[class.index()]
    }

    /// Value the next message of `class` will use, without consuming it
    pub fn peek(&self, class: MessageClass) -> VeilResult<u64> {
        let value = self.values[class.index()];
        if value == u64::MAX {
            return Err(VeilError::NonceExhausted);
        }
        Ok(value)
    }

    /// Consume the current value of a counter
    pub fn commit(&mut self, class: MessageClass) -> VeilResult<()> {
        let slot = &mut self.values[class.index()];
        *slot = slot.checked_add(1).ok_or(VeilError::NonceExhausted)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set(&mut self, class: MessageClass, value: u64) {
        self.values[class.index()] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_nonce() {
        let base = [0xffu8; NONCE_SIZE];
        let nonce = derive_nonce(&base, MessageClass::Begin, 1);
        assert_eq!(nonce[0], 0xfe);
        assert_eq!(nonce[1..4], base[1..4]);
        assert_eq!(nonce[4], 0xfe);
        assert_eq!(nonce[5..], base[5..]);

        assert_ne!(
            derive_nonce(&base, MessageClass::Begin, 1),
            derive_nonce(&base, MessageClass::Begin, 2)
        );
        assert_ne!(
            derive_nonce(&base, MessageClass::Begin, 0),
            derive_nonce(&base, MessageClass::UpstreamData, 0)
        );
    }

    #[test]
    fn test_counters_independent() {
        let mut counters = NonceCounters::new();
        counters.commit(MessageClass::DownstreamData).unwrap();
        counters.commit(MessageClass::DownstreamData).unwrap();
        counters.commit(MessageClass::Begin).unwrap();

        assert_eq!(counters.get(MessageClass::Begin), 1);
        assert_eq!(counters.get(MessageClass::DownstreamData), 2);
        assert_eq!(counters.get(MessageClass::UpstreamData), 0);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let counters = NonceCounters::new();
        assert_eq!(counters.peek(MessageClass::UpstreamData).unwrap(), 0);
        assert_eq!(counters.peek(MessageClass::UpstreamData).unwrap(), 0);
    }

    #[test]
    fn test_exhaustion() {
        let mut counters = NonceCounters::new();
        counters.set(MessageClass::Begin, u64::MAX - 1);
        assert!(counters.peek(MessageClass::Begin).is_ok());
        counters.commit(MessageClass::Begin).unwrap();
        assert!(matches!(
            counters.peek(MessageClass::Begin),
            Err(VeilError::NonceExhausted)
        ));
        assert!(counters.commit(MessageClass::Begin).is_err());
    }
}
