//! Circuit Building
//!
//! Telescoping construction of a client circuit:
//!
//! 1. pick `hops` distinct online relays (CSPRNG shuffle; a pinned exit goes
//!    last),
//! 2. generate fresh hop keys and wrap each under its relay's RSA key,
//! 3. save the circuit in `Building` state and dial the entry relay,
//! 4. for each hop send EXTEND (naming the following hop) through the entry
//!    link and wait for the CREATED that proves the right relay answered.
//!
//! Any failure sends DESTROY, deletes the circuit and wipes its keys.

use crate::cell::{Cell, Command};
use crate::circuit::{Circuit, CircuitId};
use crate::crypto::{wrap_hop_keys, HopKeys};
use crate::payload::{ExtendPayload, Payload};
use crate::relay::{RelayDescriptor, RelayId};
use crate::repository::{CircuitRepository, RelayRepository};
use crate::transport::{Link, TcpTransport, Transport};
use crate::{VeilError, VeilResult, MAX_CIRCUIT_LENGTH};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A circuit that finished its handshake
#[derive(Debug, Clone)]
pub struct BuiltCircuit {
    pub id: CircuitId,
    /// Link to the entry relay
    pub link: Arc<Link>,
}

/// Client-side circuit builder
pub struct CircuitBuilder {
    relays: Arc<dyn RelayRepository>,
    circuits: Arc<dyn CircuitRepository>,
    transport: Arc<dyn Transport>,
}

impl CircuitBuilder {
    /// Builder over plain TCP
    pub fn new(relays: Arc<dyn RelayRepository>, circuits: Arc<dyn CircuitRepository>) -> Self {
        Self::with_transport(relays, circuits, Arc::new(TcpTransport))
    }

    pub fn with_transport(
        relays: Arc<dyn RelayRepository>,
        circuits: Arc<dyn CircuitRepository>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            relays,
            circuits,
            transport,
        }
    }

    /// Choose `hops` distinct online relays, `exit` (if any) last
    pub fn select_path(
        &self,
        hops: usize,
        exit: Option<&RelayId>,
    ) -> VeilResult<Vec<RelayDescriptor>> {
        if hops == 0 || hops > MAX_CIRCUIT_LENGTH {
            return Err(VeilError::InvalidCircuitLength(hops, MAX_CIRCUIT_LENGTH));
        }

        let mut pool = self.relays.online_relays();
        let pinned = match exit {
            Some(id) => {
                let index = pool
                    .iter()
                    .position(|relay| &relay.id == id)
                    .ok_or_else(|| VeilError::RelayNotFound(id.to_hex()))?;
                Some(pool.swap_remove(index))
            }
            None => None,
        };

        let available = pool.len() + usize::from(pinned.is_some());
        if available < hops {
            return Err(VeilError::NotEnoughRelays {
                requested: hops,
                available,
            });
        }

        pool.shuffle(&mut OsRng);
        let random = hops - usize::from(pinned.is_some());
        let mut path: Vec<RelayDescriptor> = pool.into_iter().take(random).collect();
        path.extend(pinned);
        Ok(path)
    }

    /// Build a circuit of `hops` relays, optionally ending at `exit`
    pub async fn build(&self, hops: usize, exit: Option<RelayId>) -> VeilResult<BuiltCircuit> {
        let path = self.select_path(hops, exit.as_ref())?;
        let id = CircuitId::generate();
        let keys: Vec<HopKeys> = path.iter().map(|_| HopKeys::generate()).collect();

        // Every EXTEND is prepared before anything is saved or dialed
        let mut extends = Vec::with_capacity(path.len());
        for (index, (relay, hop_keys)) in path.iter().zip(&keys).enumerate() {
            let wrapped = wrap_hop_keys(&relay.rsa_public_key()?, hop_keys)?;
            let extend = ExtendPayload {
                next_hop: path.get(index + 1).map(|next| next.address),
                wrapped_keys: wrapped.into(),
            };
            extends.push(Cell::new(Command::Extend, extend.encode())?);
        }

        let entry = path[0].address;
        let circuit = Circuit::new(id, path.iter().cloned().zip(keys).collect());
        self.circuits.save(Arc::new(Mutex::new(circuit)));
        debug!("Building circuit {} through {} hops", id, path.len());

        let link = match self.transport.dial(entry).await {
            Ok(link) => link,
            Err(e) => {
                warn!("Circuit {}: entry {} unreachable: {}", id, entry, e);
                self.discard(id);
                return Err(e);
            }
        };

        if let Err(e) = self.telescope(&link, id, &path, extends).await {
            warn!("Circuit {} failed: {}", id, e);
            self.transport.send_destroy(&link, id).await;
            link.shutdown().await;
            self.discard(id);
            return Err(e);
        }

        let circuit = self.circuits.find(&id).ok_or(VeilError::CircuitNotFound(id))?;
        circuit.lock().mark_ready()?;

        info!(
            "Circuit {} ready: {}",
            id,
            path.iter()
                .map(|relay| relay.nickname.as_str())
                .collect::<Vec<_>>()
                .join(" -> ")
        );
        Ok(BuiltCircuit { id, link })
    }

    async fn telescope(
        &self,
        link: &Link,
        id: CircuitId,
        path: &[RelayDescriptor],
        extends: Vec<Cell>,
    ) -> VeilResult<()> {
        for (hop, (relay, extend)) in path.iter().zip(extends).enumerate() {
            self.transport.send_cell(link, id, extend).await?;
            let created = self.transport.wait_ack(link, id).await?;
            if created.public_key[..] != relay.public_key[..] {
                return Err(VeilError::RelayKeyMismatch(relay.nickname.clone()));
            }
            debug!("Circuit {}: hop {} ({}) extended", id, hop, relay.id);
        }
        Ok(())
    }

    fn discard(&self, id: CircuitId) {
        if let Some(circuit) = self.circuits.delete(&id) {
            circuit.lock().wipe();
        }
    }
}
