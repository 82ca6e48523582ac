//! VeilNet Client
//!
//! The facade a front end (the SOCKS listener, or an embedding application)
//! uses to build circuits and move stream data through them.
//!
//! # Example
//!
//! ```ignore
//! let circuit_id = client.build_circuit(3, None).await?;
//! let stream_id = client.open_stream(circuit_id)?;
//! let mut events = client.subscribe(circuit_id, stream_id)?;
//! client.send_begin(circuit_id, stream_id, "example.com:80").await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         StreamEvent::Connected => client.send_data(circuit_id, stream_id, b"GET /").await?,
//!         StreamEvent::Data(bytes) => println!("{} bytes", bytes.len()),
//!         _ => break,
//!     }
//! }
//! ```

use crate::builder::CircuitBuilder;
use crate::cell::{write_frame, Cell, Command, Frame};
use crate::circuit::{CircuitId, SharedCircuit, StreamId, CONTROL_STREAM};
use crate::config::CircuitConfig;
use crate::crypto::MessageClass;
use crate::hidden::HiddenAddress;
use crate::payload::{
    AckStatus, BeginAckPayload, BeginPayload, ConnectPayload, DataPayload, EndPayload, Payload,
};
use crate::relay::RelayId;
use crate::repository::{CircuitRepository, HiddenServiceRepository, RelayRepository};
use crate::transport::{Link, Transport};
use crate::{VeilError, VeilResult};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

/// What happened on a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The exit reached the target
    Connected,
    /// The exit could not reach the target
    Rejected(AckStatus),
    /// Bytes from the target
    Data(Bytes),
    /// The stream or its circuit is gone
    Closed,
}

type Handles = Arc<RwLock<HashMap<CircuitId, Arc<CircuitHandle>>>>;

/// Link and return-path plumbing for one circuit
struct CircuitHandle {
    link: Arc<Link>,
    reader: Mutex<Option<AbortHandle>>,
    subscribers: Mutex<HashMap<StreamId, mpsc::Sender<StreamEvent>>>,
}

impl CircuitHandle {
    fn new(link: Arc<Link>) -> Self {
        Self {
            link,
            reader: Mutex::new(None),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    async fn deliver(&self, stream_id: StreamId, event: StreamEvent) {
        let sender = self.subscribers.lock().get(&stream_id).cloned();
        match sender {
            Some(sender) => {
                if sender.send(event).await.is_err() {
                    trace!("Subscriber of stream {} went away", stream_id);
                    self.subscribers.lock().remove(&stream_id);
                }
            }
            None => trace!("No subscriber for stream {}", stream_id),
        }
    }

    /// Send a final event and forget the subscriber
    async fn finish(&self, stream_id: StreamId, event: StreamEvent) {
        self.deliver(stream_id, event).await;
        self.subscribers.lock().remove(&stream_id);
    }

    /// Tell every subscriber the circuit is gone
    fn close_all(&self) {
        let subscribers: Vec<_> = self.subscribers.lock().drain().collect();
        for (_, sender) in subscribers {
            let _ = sender.try_send(StreamEvent::Closed);
        }
    }

    fn stop_reader(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

/// Client facade over circuits and streams
pub struct VeilClient {
    config: CircuitConfig,
    circuits: Arc<dyn CircuitRepository>,
    hidden: Arc<dyn HiddenServiceRepository>,
    builder: CircuitBuilder,
    handles: Handles,
}

impl VeilClient {
    pub fn new(
        config: CircuitConfig,
        relays: Arc<dyn RelayRepository>,
        circuits: Arc<dyn CircuitRepository>,
        hidden: Arc<dyn HiddenServiceRepository>,
    ) -> Self {
        let builder = CircuitBuilder::new(relays, circuits.clone());
        Self::with_builder(config, circuits, hidden, builder)
    }

    /// Client whose circuits are built over `transport`
    pub fn with_transport(
        config: CircuitConfig,
        relays: Arc<dyn RelayRepository>,
        circuits: Arc<dyn CircuitRepository>,
        hidden: Arc<dyn HiddenServiceRepository>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let builder = CircuitBuilder::with_transport(relays, circuits.clone(), transport);
        Self::with_builder(config, circuits, hidden, builder)
    }

    fn with_builder(
        config: CircuitConfig,
        circuits: Arc<dyn CircuitRepository>,
        hidden: Arc<dyn HiddenServiceRepository>,
        builder: CircuitBuilder,
    ) -> Self {
        Self {
            config,
            circuits,
            hidden,
            builder,
            handles: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Ids of circuits that are ready to carry streams
    pub fn circuit_ids(&self) -> Vec<CircuitId> {
        self.handles.read().keys().copied().collect()
    }

    pub fn is_alive(&self, circuit_id: &CircuitId) -> bool {
        self.handles.read().contains_key(circuit_id)
    }

    fn circuit(&self, circuit_id: CircuitId) -> VeilResult<SharedCircuit> {
        self.circuits
            .find(&circuit_id)
            .ok_or(VeilError::CircuitNotFound(circuit_id))
    }

    fn handle(&self, circuit_id: CircuitId) -> VeilResult<Arc<CircuitHandle>> {
        self.handles
            .read()
            .get(&circuit_id)
            .cloned()
            .ok_or(VeilError::CircuitNotFound(circuit_id))
    }

    fn ensure_open(&self, circuit_id: CircuitId, stream_id: StreamId) -> VeilResult<SharedCircuit> {
        let circuit = self.circuit(circuit_id)?;
        if !circuit.lock().is_stream_open(stream_id) {
            return Err(VeilError::StreamNotFound(stream_id));
        }
        Ok(circuit)
    }

    // ========== Circuits ==========

    /// Build a circuit and start reading its return path
    pub async fn build_circuit(&self, hops: usize, exit: Option<RelayId>) -> VeilResult<CircuitId> {
        let built = self.builder.build(hops, exit).await?;
        let handle = Arc::new(CircuitHandle::new(built.link));
        self.handles.write().insert(built.id, handle.clone());

        let task = tokio::spawn(read_circuit(
            built.id,
            handle.clone(),
            self.circuits.clone(),
            self.handles.clone(),
        ));
        *handle.reader.lock() = Some(task.abort_handle());
        Ok(built.id)
    }

    /// Tear a circuit down locally and at every relay
    pub async fn destroy_circuit(&self, circuit_id: CircuitId) -> VeilResult<()> {
        let handle = self.handles.write().remove(&circuit_id);
        let circuit = self.circuits.delete(&circuit_id);
        if handle.is_none() && circuit.is_none() {
            return Err(VeilError::CircuitNotFound(circuit_id));
        }

        if let Some(circuit) = circuit {
            circuit.lock().wipe();
        }
        if let Some(handle) = handle {
            handle.stop_reader();
            handle.close_all();
            if let Err(e) = handle.link.send(&Frame::new(circuit_id, Cell::destroy())).await {
                debug!("DESTROY for {} not delivered: {}", circuit_id, e);
            }
            handle.link.shutdown().await;
        }
        info!("Circuit {} destroyed", circuit_id);
        Ok(())
    }

    /// Exit relay hosting a hidden service
    pub fn resolve_hidden(&self, address: &HiddenAddress) -> VeilResult<RelayId> {
        self.hidden
            .find(address)
            .map(|record| record.exit)
            .ok_or_else(|| VeilError::HiddenServiceNotFound(address.to_string()))
    }

    // ========== Streams ==========

    /// Allocate a stream id on a ready circuit
    pub fn open_stream(&self, circuit_id: CircuitId) -> VeilResult<StreamId> {
        let circuit = self.circuit(circuit_id)?;
        let mut circuit = circuit.lock();
        if circuit.open_streams().len() >= self.config.max_streams {
            return Err(VeilError::StreamLimitReached(circuit_id));
        }
        circuit.open_stream()
    }

    /// Receive the events of an open stream. A second call replaces the
    /// first receiver.
    pub fn subscribe(
        &self,
        circuit_id: CircuitId,
        stream_id: StreamId,
    ) -> VeilResult<mpsc::Receiver<StreamEvent>> {
        let handle = self.handle(circuit_id)?;
        self.ensure_open(circuit_id, stream_id)?;

        let (sender, receiver) = mpsc::channel(self.config.stream_buffer);
        handle.subscribers.lock().insert(stream_id, sender);
        Ok(receiver)
    }

    /// Ask the exit to open `stream_id` to `target` ("host:port")
    pub async fn send_begin(
        &self,
        circuit_id: CircuitId,
        stream_id: StreamId,
        target: &str,
    ) -> VeilResult<()> {
        if stream_id == CONTROL_STREAM {
            return Err(VeilError::StreamRejected(
                stream_id,
                "BEGIN on the control stream".into(),
            ));
        }
        let circuit = self.ensure_open(circuit_id, stream_id)?;
        let begin = BeginPayload {
            stream_id,
            target: target.to_string(),
        }
        .encode();
        check_fits(&circuit, target, &begin)?;
        self.send_sealed(circuit_id, Command::Begin, MessageClass::Begin, begin)
            .await
    }

    /// Attach the circuit to `target` at the exit; an empty target reaches
    /// the hidden service hosted there. Events arrive on stream 0.
    pub async fn connect(
        &self,
        circuit_id: CircuitId,
        target: &str,
    ) -> VeilResult<mpsc::Receiver<StreamEvent>> {
        let circuit = self.circuit(circuit_id)?;
        let connect = ConnectPayload {
            target: target.to_string(),
        }
        .encode();
        check_fits(&circuit, target, &connect)?;

        circuit.lock().bind_control_stream()?;
        let events = self.subscribe(circuit_id, CONTROL_STREAM)?;
        if let Err(e) = self
            .send_sealed(circuit_id, Command::Connect, MessageClass::Begin, connect)
            .await
        {
            circuit.lock().close_stream(CONTROL_STREAM);
            if let Ok(handle) = self.handle(circuit_id) {
                handle.subscribers.lock().remove(&CONTROL_STREAM);
            }
            return Err(e);
        }
        Ok(events)
    }

    /// Send bytes on a stream, split into as many DATA cells as needed
    pub async fn send_data(
        &self,
        circuit_id: CircuitId,
        stream_id: StreamId,
        data: &[u8],
    ) -> VeilResult<()> {
        let circuit = self.ensure_open(circuit_id, stream_id)?;
        let chunk_size = circuit.lock().max_stream_data();

        for chunk in data.chunks(chunk_size) {
            let payload = DataPayload {
                stream_id,
                data: Bytes::copy_from_slice(chunk),
            };
            self.send_sealed(
                circuit_id,
                Command::Data,
                MessageClass::DownstreamData,
                payload.encode(),
            )
            .await?;
        }
        Ok(())
    }

    /// Close a stream locally and tell the exit
    pub async fn close_stream(&self, circuit_id: CircuitId, stream_id: StreamId) -> VeilResult<()> {
        let handle = self.handle(circuit_id)?;
        let was_open = self.circuit(circuit_id)?.lock().close_stream(stream_id);
        handle.subscribers.lock().remove(&stream_id);
        if !was_open {
            debug!("Stream {} on {} already closed", stream_id, circuit_id);
            return Ok(());
        }

        let end = Cell::new(Command::End, EndPayload { stream_id }.encode())?;
        if let Err(e) = handle.link.send(&Frame::new(circuit_id, end)).await {
            debug!("END for stream {} on {} not delivered: {}", stream_id, circuit_id, e);
        }
        Ok(())
    }

    /// The exit closed a stream
    pub async fn handle_end(&self, circuit_id: CircuitId, stream_id: StreamId) -> VeilResult<()> {
        let handle = self.handle(circuit_id)?;
        let circuit = self.circuit(circuit_id)?;
        end_stream(circuit_id, &circuit, &handle, stream_id).await;
        Ok(())
    }

    /// Seal under every hop and write the cell.
    ///
    /// Both steps run on their own task: once the nonces are committed the
    /// cell has to reach the wire even if the caller is dropped.
    async fn send_sealed(
        &self,
        circuit_id: CircuitId,
        command: Command,
        class: MessageClass,
        payload: Bytes,
    ) -> VeilResult<()> {
        let handle = self.handle(circuit_id)?;
        let circuit = self.circuit(circuit_id)?;

        tokio::spawn(seal_and_write(handle, circuit, circuit_id, command, class, payload))
            .await
            .map_err(|e| VeilError::Internal(format!("cell writer for {}: {}", circuit_id, e)))?
    }
}

/// Refuse a BEGIN or CONNECT whose sealed form would not fit one cell
fn check_fits(circuit: &SharedCircuit, target: &str, encoded: &[u8]) -> VeilResult<()> {
    let limit = circuit.lock().max_sealed_plaintext();
    if encoded.len() > limit {
        return Err(VeilError::InvalidPayload(format!(
            "target {:.32}... encodes to {} bytes, a cell on this circuit holds {}",
            target,
            encoded.len(),
            limit
        )));
    }
    Ok(())
}

/// Hold the link's write lock across seal and write so nonce order equals
/// wire order. A failed write leaves the relays a nonce behind, so the link
/// is shut down.
async fn seal_and_write(
    handle: Arc<CircuitHandle>,
    circuit: SharedCircuit,
    circuit_id: CircuitId,
    command: Command,
    class: MessageClass,
    payload: Bytes,
) -> VeilResult<()> {
    let mut writer = handle.link.lock_writer().await;
    let sealed = circuit.lock().seal_downstream(class, &payload)?;
    let frame = Frame::new(circuit_id, Cell::new(command, sealed)?);
    if let Err(e) = write_frame(&mut *writer, &frame).await {
        drop(writer);
        warn!("Write on circuit {} failed: {}", circuit_id, e);
        handle.link.shutdown().await;
        return Err(e);
    }
    Ok(())
}

async fn end_stream(
    circuit_id: CircuitId,
    circuit: &SharedCircuit,
    handle: &CircuitHandle,
    stream_id: StreamId,
) {
    if circuit.lock().close_stream(stream_id) {
        debug!("Stream {} on {} closed by exit", stream_id, circuit_id);
    }
    handle.finish(stream_id, StreamEvent::Closed).await;
}

/// Return path of one circuit: everything the entry relay sends back
async fn read_circuit(
    circuit_id: CircuitId,
    handle: Arc<CircuitHandle>,
    circuits: Arc<dyn CircuitRepository>,
    handles: Handles,
) {
    loop {
        let frame = match handle.link.recv().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!("Link of circuit {} failed: {}", circuit_id, e);
                break;
            }
        };
        if frame.circuit_id != circuit_id {
            debug!("Ignoring frame for {} on link of {}", frame.circuit_id, circuit_id);
            continue;
        }
        let Some(circuit) = circuits.find(&circuit_id) else {
            return;
        };

        match frame.cell.command {
            Command::Data => {
                let opened = circuit.lock().open_upstream(&frame.cell.payload);
                match opened.and_then(|plaintext| DataPayload::decode(&plaintext)) {
                    Ok(data) => {
                        handle
                            .deliver(data.stream_id, StreamEvent::Data(data.data))
                            .await
                    }
                    Err(e) => warn!("Dropping DATA on {}: {}", circuit_id, e),
                }
            }
            Command::BeginAck => match BeginAckPayload::decode(&frame.cell.payload) {
                Ok(ack) if ack.status.is_ok() => {
                    handle.deliver(ack.stream_id, StreamEvent::Connected).await
                }
                Ok(ack) => {
                    debug!("Stream {} on {}: {}", ack.stream_id, circuit_id, ack.status);
                    circuit.lock().close_stream(ack.stream_id);
                    handle
                        .finish(ack.stream_id, StreamEvent::Rejected(ack.status))
                        .await;
                }
                Err(e) => warn!("Bad BEGINACK on {}: {}", circuit_id, e),
            },
            Command::End => match EndPayload::decode(&frame.cell.payload) {
                Ok(end) => end_stream(circuit_id, &circuit, &handle, end.stream_id).await,
                Err(e) => warn!("Bad END on {}: {}", circuit_id, e),
            },
            Command::Destroy => {
                info!("Circuit {} destroyed by relay", circuit_id);
                break;
            }
            other => debug!("Unexpected {} on circuit {}", other, circuit_id),
        }
    }

    handles.write().remove(&circuit_id);
    if let Some(circuit) = circuits.delete(&circuit_id) {
        circuit.lock().wipe();
    }
    handle.close_all();
    debug!("Return path of {} closed", circuit_id);
}
