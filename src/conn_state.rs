//! Relay Connection State
//!
//! Everything a relay knows about one circuit passing through it: the hop
//! keys and nonce counters, the upstream link, what sits downstream, and the
//! destination streams an exit has opened.
//!
//! # Roles
//!
//! A relay never learns its position from the client. It is a **middle**
//! when its downstream is another relay and an **exit** otherwise.
//!
//! # Locking
//!
//! [`ConnStateTable`] maps circuit ids to `Arc<Mutex<ConnState>>`. When both
//! are needed the table lock is taken before the entry lock. Neither is
//! held across an `.await`.

use crate::cell::{Cell, Frame};
use crate::circuit::{CircuitId, StreamId, CONTROL_STREAM};
use crate::crypto::{HopCrypto, HopKeys};
use crate::transport::Link;
use crate::{VeilError, VeilResult};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info};

/// Position of this relay in a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayRole {
    Middle,
    Exit,
}

/// What a circuit is attached to on the far side of this relay
#[derive(Debug, Clone)]
pub enum Downstream {
    /// Exit without a CONNECT target yet
    Unbound,
    /// Link to the next relay
    Relay(Arc<Link>),
    /// Destination attached by CONNECT (stream 0)
    Destination(Arc<DestinationStream>),
}

/// Exit-side TCP connection to a destination
#[derive(Debug)]
pub struct DestinationStream {
    stream_id: StreamId,
    target: String,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    reader: Mutex<Option<AbortHandle>>,
    closed: AtomicBool,
}

impl DestinationStream {
    /// Dial `target` ("host:port"); returns the stream and its read half
    pub async fn connect(
        stream_id: StreamId,
        target: &str,
    ) -> VeilResult<(Arc<Self>, OwnedReadHalf)> {
        let socket = TcpStream::connect(target)
            .await
            .map_err(|e| VeilError::DialFailed {
                addr: target.to_string(),
                reason: e.to_string(),
            })?;
        socket.set_nodelay(true)?;
        let (reader, writer) = socket.into_split();

        let stream = Arc::new(Self {
            stream_id,
            target: target.to_string(),
            writer: tokio::sync::Mutex::new(writer),
            reader: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        Ok((stream, reader))
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Attach the task pumping the read half upstream
    pub fn set_reader(&self, handle: AbortHandle) {
        let mut reader = self.reader.lock();
        if self.is_closed() {
            handle.abort();
        } else {
            *reader = Some(handle);
        }
    }

    /// Write plaintext to the destination
    pub async fn write_all(&self, data: &[u8]) -> VeilResult<()> {
        if self.is_closed() {
            return Err(VeilError::StreamClosed(self.stream_id));
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        Ok(())
    }

    /// Stop the reader task. The socket closes once the last handle drops.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let reader = self.reader.lock().take();
        if let Some(handle) = reader {
            handle.abort();
        }
    }
}

/// Per-circuit cell counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnStats {
    /// Cells sent toward the exit
    pub downstream: u64,
    /// Cells sent toward the client
    pub upstream: u64,
    /// Cells dropped by the state machine
    pub dropped: u64,
}

/// One circuit's state at this relay
#[derive(Debug)]
pub struct ConnState {
    circuit_id: CircuitId,
    crypto: HopCrypto,
    upstream: Arc<Link>,
    downstream: Downstream,
    streams: HashMap<StreamId, Arc<DestinationStream>>,
    downstream_task: Option<AbortHandle>,
    last_used: Instant,
    served: bool,
    stats: ConnStats,
}

/// Circuit state shared between the relay's tasks
pub type SharedConnState = Arc<Mutex<ConnState>>;

impl ConnState {
    pub fn new(circuit_id: CircuitId, keys: HopKeys, upstream: Arc<Link>) -> Self {
        Self {
            circuit_id,
            crypto: HopCrypto::new(keys),
            upstream,
            downstream: Downstream::Unbound,
            streams: HashMap::new(),
            downstream_task: None,
            last_used: Instant::now(),
            served: false,
            stats: ConnStats::default(),
        }
    }

    pub fn circuit_id(&self) -> CircuitId {
        self.circuit_id
    }

    pub fn role(&self) -> RelayRole {
        match self.downstream {
            Downstream::Relay(_) => RelayRole::Middle,
            _ => RelayRole::Exit,
        }
    }

    pub fn crypto_mut(&mut self) -> &mut HopCrypto {
        &mut self.crypto
    }

    pub fn upstream(&self) -> &Arc<Link> {
        &self.upstream
    }

    pub fn downstream(&self) -> &Downstream {
        &self.downstream
    }

    pub fn downstream_link(&self) -> Option<Arc<Link>> {
        match &self.downstream {
            Downstream::Relay(link) => Some(link.clone()),
            _ => None,
        }
    }

    /// Replace the downstream; a previously bound destination is closed
    pub fn set_downstream(&mut self, downstream: Downstream) {
        let previous = std::mem::replace(&mut self.downstream, downstream);
        if let Downstream::Destination(stream) = previous {
            stream.close();
        }
    }

    /// Detach the CONNECT destination if it is still `stream`
    pub fn unbind_destination_if(&mut self, stream: &Arc<DestinationStream>) -> bool {
        match &self.downstream {
            Downstream::Destination(current) if Arc::ptr_eq(current, stream) => {
                self.downstream = Downstream::Unbound;
                true
            }
            _ => false,
        }
    }

    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn is_idle(&self, ttl: Duration) -> bool {
        self.last_used.elapsed() >= ttl
    }

    /// True only the first time; gates the downstream reader
    pub fn mark_served(&mut self) -> bool {
        !std::mem::replace(&mut self.served, true)
    }

    pub fn set_downstream_task(&mut self, handle: AbortHandle) {
        if let Some(old) = self.downstream_task.replace(handle) {
            old.abort();
        }
    }

    pub fn stats(&self) -> ConnStats {
        self.stats
    }

    pub fn stats_mut(&mut self) -> &mut ConnStats {
        &mut self.stats
    }

    /// Bind an exit stream; a stream already using the id is closed
    pub fn bind_stream(&mut self, stream: Arc<DestinationStream>) {
        if let Some(old) = self.streams.insert(stream.stream_id(), stream) {
            old.close();
        }
    }

    pub fn take_stream(&mut self, stream_id: StreamId) -> Option<Arc<DestinationStream>> {
        self.streams.remove(&stream_id)
    }

    /// Destination for `stream_id`; stream 0 is the CONNECT destination
    pub fn stream_writer(&self, stream_id: StreamId) -> Option<Arc<DestinationStream>> {
        if stream_id == CONTROL_STREAM {
            return match &self.downstream {
                Downstream::Destination(stream) => Some(stream.clone()),
                _ => None,
            };
        }
        self.streams.get(&stream_id).cloned()
    }

    /// Remove `stream_id` only if it is still bound to `stream`
    pub fn remove_stream_if(&mut self, stream_id: StreamId, stream: &Arc<DestinationStream>) -> bool {
        if stream_id == CONTROL_STREAM {
            return self.unbind_destination_if(stream);
        }
        match self.streams.get(&stream_id) {
            Some(current) if Arc::ptr_eq(current, stream) => {
                self.streams.remove(&stream_id);
                true
            }
            _ => false,
        }
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn close_all_streams(&mut self) {
        for (_, stream) in self.streams.drain() {
            stream.close();
        }
    }

    /// Close streams and destination, stop the downstream reader. Returns
    /// the downstream relay link, which the caller should shut down.
    pub fn close(&mut self) -> Option<Arc<Link>> {
        self.close_all_streams();
        if let Some(task) = self.downstream_task.take() {
            task.abort();
        }
        match std::mem::replace(&mut self.downstream, Downstream::Unbound) {
            Downstream::Relay(link) => Some(link),
            Downstream::Destination(stream) => {
                stream.close();
                None
            }
            Downstream::Unbound => None,
        }
    }
}

/// All circuits passing through this relay
#[derive(Debug, Default)]
pub struct ConnStateTable {
    entries: RwLock<HashMap<CircuitId, SharedConnState>>,
}

impl ConnStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, state: ConnState) -> SharedConnState {
        let id = state.circuit_id();
        let shared = Arc::new(Mutex::new(state));
        self.entries.write().insert(id, shared.clone());
        shared
    }

    pub fn find(&self, id: &CircuitId) -> Option<SharedConnState> {
        self.entries.read().get(id).cloned()
    }

    pub fn remove(&self, id: &CircuitId) -> Option<SharedConnState> {
        self.entries.write().remove(id)
    }

    pub fn contains(&self, id: &CircuitId) -> bool {
        self.entries.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Remove every circuit arriving over `link`
    pub fn remove_by_upstream(&self, link: &Arc<Link>) -> Vec<SharedConnState> {
        let mut entries = self.entries.write();
        let ids: Vec<CircuitId> = entries
            .iter()
            .filter(|(_, state)| Arc::ptr_eq(state.lock().upstream(), link))
            .map(|(id, _)| *id)
            .collect();
        ids.iter().filter_map(|id| entries.remove(id)).collect()
    }

    /// Remove entries idle for at least `ttl`
    pub fn sweep(&self, ttl: Duration) -> Vec<SharedConnState> {
        let mut entries = self.entries.write();
        let idle: Vec<CircuitId> = entries
            .iter()
            .filter(|(_, state)| state.lock().is_idle(ttl))
            .map(|(id, _)| *id)
            .collect();
        idle.iter().filter_map(|id| entries.remove(id)).collect()
    }

    /// Sweep every `ttl / 2`, tearing down evicted circuits
    pub fn spawn_sweeper(self: Arc<Self>, ttl: Duration) -> JoinHandle<()> {
        let period = (ttl / 2).max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let evicted = self.sweep(ttl);
                if evicted.is_empty() {
                    continue;
                }
                info!("Evicting {} idle circuits", evicted.len());
                for state in evicted {
                    close_evicted(&state).await;
                }
            }
        })
    }
}

/// Close the downstream side of an entry already removed from the table
pub async fn close_downstream(state: &SharedConnState) -> (CircuitId, Arc<Link>) {
    let (id, downstream, upstream) = {
        let mut state = state.lock();
        let downstream = state.close();
        (state.circuit_id(), downstream, state.upstream().clone())
    };
    debug!("Closing circuit {}", id);
    if let Some(link) = downstream {
        if let Err(e) = link.send(&Frame::new(id, Cell::destroy())).await {
            debug!("DESTROY for {} downstream not delivered: {}", id, e);
        }
        link.shutdown().await;
    }
    (id, upstream)
}

/// Close an evicted entry on both sides.
///
/// The upstream link may carry other circuits, so it stays open and only
/// this circuit is torn down there with a DESTROY.
pub async fn close_evicted(state: &SharedConnState) {
    let (id, upstream) = close_downstream(state).await;
    if let Err(e) = upstream.send(&Frame::new(id, Cell::destroy())).await {
        debug!("DESTROY for {} upstream not delivered: {}", id, e);
    }
}
