//! Relay Cell Dispatch
//!
//! The per-circuit state machine a relay runs for every frame it reads.
//!
//! # States
//!
//! A circuit id is either **Unknown** (no [`ConnState`]) or **Established**.
//!
//! | State       | Cell            | Action                                                |
//! |-------------|-----------------|-------------------------------------------------------|
//! | Unknown     | EXTEND          | unwrap keys, dial next hop, reply CREATED             |
//! | Unknown     | anything else   | ignored                                               |
//! | Established | EXTEND          | forwarded downstream                                  |
//! | Established | BEGIN / CONNECT | peel; middle forwards, exit dials and replies BEGINACK |
//! | Established | DATA            | trial-open, see below                                 |
//! | Established | END             | middle forwards, exit closes the stream               |
//! | Established | DESTROY         | propagated downstream, state removed                  |
//!
//! # Direction of DATA
//!
//! Cells carry no direction flag. A relay trial-opens every DATA cell with
//! its downstream-data nonce. Success means the cell travels toward the
//! exit. On a middle relay failure means the cell is response traffic: the
//! relay adds its own layer under the upstream-data nonce and sends it back
//! toward the client. On an exit failure is an error for that cell.

use crate::cell::{write_frame, Cell, Command, Frame};
use crate::circuit::{CircuitId, StreamId, CONTROL_STREAM};
use crate::conn_state::{
    ConnState, ConnStateTable, DestinationStream, Downstream, RelayRole, SharedConnState,
};
use crate::crypto::{AeadOnion, MessageClass, OnionCrypto, RelayKeyPair};
use crate::payload::{
    AckStatus, BeginAckPayload, BeginPayload, ConnectPayload, CreatedPayload, DataPayload,
    EndPayload, ExtendPayload, Payload,
};
use crate::transport::Link;
use crate::{VeilError, VeilResult, EXIT_READ_CHUNK, LAYER_OVERHEAD, MAX_PAYLOAD_SIZE};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tracing::{debug, info, trace, warn};

/// Relay-side frame handling
#[async_trait]
pub trait RelayDispatch: Send + Sync {
    /// Handle one frame read from `upstream`.
    ///
    /// Protocol errors are returned and end the connection; everything else
    /// is handled (or logged) here.
    async fn dispatch(&self, upstream: &Arc<Link>, frame: Frame) -> VeilResult<()>;
}

/// Onion-routing dispatcher backed by a [`ConnStateTable`]
#[derive(Clone)]
pub struct CellDispatcher {
    table: Arc<ConnStateTable>,
    keys: Arc<RelayKeyPair>,
    public_key_der: Bytes,
    crypto: Arc<dyn OnionCrypto>,
    hidden_target: Option<String>,
}

impl CellDispatcher {
    /// Create a dispatcher. `hidden_target` is dialed for CONNECT cells
    /// with an empty target.
    pub fn new(
        table: Arc<ConnStateTable>,
        keys: Arc<RelayKeyPair>,
        hidden_target: Option<String>,
    ) -> VeilResult<Self> {
        let public_key_der = Bytes::from(keys.public_key_der()?);
        Ok(Self {
            table,
            keys,
            public_key_der,
            crypto: Arc::new(AeadOnion::new()),
            hidden_target,
        })
    }

    pub fn table(&self) -> &Arc<ConnStateTable> {
        &self.table
    }

    pub fn hidden_target(&self) -> Option<&str> {
        self.hidden_target.as_deref()
    }

    // ========== Unknown Circuits ==========

    async fn on_extend_new(
        &self,
        upstream: &Arc<Link>,
        circuit_id: CircuitId,
        payload: &[u8],
    ) -> VeilResult<()> {
        match self.establish(upstream, circuit_id, payload).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("EXTEND for {} failed: {}", circuit_id, e);
                send_best_effort(upstream, Frame::new(circuit_id, Cell::destroy())).await;
                if e.is_protocol_error() {
                    Err(e)
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn establish(
        &self,
        upstream: &Arc<Link>,
        circuit_id: CircuitId,
        payload: &[u8],
    ) -> VeilResult<()> {
        let extend = ExtendPayload::decode(payload)?;
        let keys = self.keys.unwrap_hop_keys(&extend.wrapped_keys)?;

        let mut state = ConnState::new(circuit_id, keys, upstream.clone());
        let next = match extend.next_hop {
            Some(addr) => {
                let link = Link::connect(addr).await?;
                state.set_downstream(Downstream::Relay(link.clone()));
                Some(link)
            }
            None => None,
        };

        let shared = self.table.insert(state);
        if let Some(link) = next {
            self.serve_downstream(&shared, circuit_id, link);
        }

        let created = CreatedPayload {
            public_key: self.public_key_der.clone(),
        };
        upstream
            .send(&Frame::new(circuit_id, Cell::new(Command::Created, created.encode())?))
            .await?;

        match extend.next_hop {
            Some(addr) => info!("Circuit {} established, next hop {}", circuit_id, addr),
            None => info!("Circuit {} established as exit", circuit_id),
        }
        Ok(())
    }

    /// Start the reader for a downstream relay link, once per circuit
    fn serve_downstream(&self, state: &SharedConnState, circuit_id: CircuitId, link: Arc<Link>) {
        let mut guard = state.lock();
        if !guard.mark_served() {
            return;
        }
        let dispatcher = self.clone();
        let handle = tokio::spawn(async move {
            dispatcher.read_downstream(circuit_id, link).await;
        });
        guard.set_downstream_task(handle.abort_handle());
    }

    // ========== Established Circuits ==========

    async fn on_begin(
        &self,
        state: &SharedConnState,
        circuit_id: CircuitId,
        cell: Cell,
    ) -> VeilResult<()> {
        let (role, opened) = {
            let mut guard = state.lock();
            let role = guard.role();
            let opened =
                guard
                    .crypto_mut()
                    .try_open(&*self.crypto, MessageClass::Begin, &cell.payload);
            if opened.is_err() {
                guard.stats_mut().dropped += 1;
            }
            (role, opened)
        };
        let plaintext = opened?;

        match (role, cell.command) {
            (RelayRole::Middle, command) => {
                self.forward_downstream(state, circuit_id, Cell::new(command, plaintext)?)
                    .await
            }
            (RelayRole::Exit, Command::Connect) => {
                let connect = ConnectPayload::decode(&plaintext)?;
                self.attach_destination(state, circuit_id, connect).await
            }
            (RelayRole::Exit, _) => {
                let begin = BeginPayload::decode(&plaintext)?;
                self.open_stream(state, circuit_id, begin).await
            }
        }
    }

    async fn open_stream(
        &self,
        state: &SharedConnState,
        circuit_id: CircuitId,
        begin: BeginPayload,
    ) -> VeilResult<()> {
        let stream_id = begin.stream_id;
        if stream_id == CONTROL_STREAM {
            warn!("BEGIN on control stream of {}", circuit_id);
            return self
                .send_ack(state, circuit_id, stream_id, AckStatus::Rejected)
                .await;
        }

        let (stream, reader) = match DestinationStream::connect(stream_id, &begin.target).await {
            Ok(connected) => connected,
            Err(e) => {
                warn!("Stream {} on {}: {}", stream_id, circuit_id, e);
                return self
                    .send_ack(state, circuit_id, stream_id, AckStatus::DialFailed)
                    .await;
            }
        };

        state.lock().bind_stream(stream.clone());
        debug!("Stream {} on {} connected to {}", stream_id, circuit_id, begin.target);

        self.send_ack(state, circuit_id, stream_id, AckStatus::Ok).await?;
        self.spawn_destination_reader(circuit_id, stream, reader);
        Ok(())
    }

    async fn attach_destination(
        &self,
        state: &SharedConnState,
        circuit_id: CircuitId,
        connect: ConnectPayload,
    ) -> VeilResult<()> {
        let target = if connect.is_hidden_service() {
            match &self.hidden_target {
                Some(target) => target.clone(),
                None => {
                    warn!("CONNECT to hidden service on {} but none is hosted", circuit_id);
                    return self
                        .send_ack(state, circuit_id, CONTROL_STREAM, AckStatus::NoHiddenService)
                        .await;
                }
            }
        } else {
            connect.target
        };

        let (stream, reader) = match DestinationStream::connect(CONTROL_STREAM, &target).await {
            Ok(connected) => connected,
            Err(e) => {
                warn!("CONNECT on {}: {}", circuit_id, e);
                return self
                    .send_ack(state, circuit_id, CONTROL_STREAM, AckStatus::DialFailed)
                    .await;
            }
        };

        state
            .lock()
            .set_downstream(Downstream::Destination(stream.clone()));
        debug!("Circuit {} attached to {}", circuit_id, target);

        self.send_ack(state, circuit_id, CONTROL_STREAM, AckStatus::Ok)
            .await?;
        self.spawn_destination_reader(circuit_id, stream, reader);
        Ok(())
    }

    async fn on_data(
        &self,
        state: &SharedConnState,
        circuit_id: CircuitId,
        payload: &[u8],
    ) -> VeilResult<()> {
        let (role, opened) = {
            let mut guard = state.lock();
            let role = guard.role();
            let opened = guard.crypto_mut().try_open(
                &*self.crypto,
                MessageClass::DownstreamData,
                payload,
            );
            (role, opened)
        };

        match (role, opened) {
            (RelayRole::Middle, Ok(plaintext)) => {
                self.forward_downstream(state, circuit_id, Cell::new(Command::Data, plaintext)?)
                    .await
            }
            (RelayRole::Exit, Ok(plaintext)) => {
                let data = DataPayload::decode(&plaintext)?;
                self.deliver(state, circuit_id, data).await
            }
            (RelayRole::Middle, Err(_)) => {
                trace!("Response DATA on {}", circuit_id);
                self.send_sealed_upstream(state, circuit_id, payload).await
            }
            (RelayRole::Exit, Err(e)) => {
                state.lock().stats_mut().dropped += 1;
                warn!("Undecryptable DATA at exit on {}", circuit_id);
                Err(e)
            }
        }
    }

    /// Write DATA plaintext to its destination
    async fn deliver(
        &self,
        state: &SharedConnState,
        circuit_id: CircuitId,
        data: DataPayload,
    ) -> VeilResult<()> {
        let stream_id = data.stream_id;
        let destination = state.lock().stream_writer(stream_id);
        let Some(stream) = destination else {
            debug!("DATA for closed stream {} on {}", stream_id, circuit_id);
            state.lock().stats_mut().dropped += 1;
            self.send_end(state, circuit_id, stream_id).await;
            return Ok(());
        };

        if let Err(e) = stream.write_all(&data.data).await {
            debug!("Write to stream {} on {} failed: {}", stream_id, circuit_id, e);
            let removed = state.lock().remove_stream_if(stream_id, &stream);
            stream.close();
            if removed {
                self.send_end(state, circuit_id, stream_id).await;
            }
        }
        Ok(())
    }

    async fn on_end(
        &self,
        state: &SharedConnState,
        circuit_id: CircuitId,
        cell: Cell,
    ) -> VeilResult<()> {
        let role = state.lock().role();
        if role == RelayRole::Middle {
            return self.forward_downstream(state, circuit_id, cell).await;
        }

        let end = EndPayload::decode(&cell.payload)?;
        if end.stream_id == CONTROL_STREAM {
            info!("Circuit {} closed by END", circuit_id);
            if let Some(state) = self.table.remove(&circuit_id) {
                state.lock().close();
            }
            return Ok(());
        }

        let stream = state.lock().take_stream(end.stream_id);
        match stream {
            Some(stream) => {
                stream.close();
                debug!("Stream {} on {} closed", end.stream_id, circuit_id);
            }
            None => debug!("END for unknown stream {} on {}", end.stream_id, circuit_id),
        }
        Ok(())
    }

    async fn on_destroy(&self, circuit_id: CircuitId) {
        let Some(state) = self.table.remove(&circuit_id) else {
            return;
        };
        let downstream = state.lock().close();
        info!("Circuit {} destroyed", circuit_id);

        if let Some(link) = downstream {
            send_best_effort(&link, Frame::new(circuit_id, Cell::destroy())).await;
            link.shutdown().await;
        }
    }

    // ========== Downstream Side ==========

    /// Cells coming back from the next relay
    async fn read_downstream(self, circuit_id: CircuitId, link: Arc<Link>) {
        loop {
            let frame = match link.recv().await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!("Downstream link of {} failed: {}", circuit_id, e);
                    break;
                }
            };

            if frame.circuit_id != circuit_id {
                debug!("Ignoring frame for {} on link of {}", frame.circuit_id, circuit_id);
                continue;
            }
            let Some(state) = self.table.find(&circuit_id) else {
                return;
            };
            state.lock().touch();

            match frame.cell.command {
                Command::Data => {
                    if let Err(e) = self.on_data(&state, circuit_id, &frame.cell.payload).await {
                        debug!("Response DATA on {} dropped: {}", circuit_id, e);
                    }
                }
                Command::Created | Command::BeginAck | Command::End => {
                    let upstream = state.lock().upstream().clone();
                    send_best_effort(&upstream, frame).await;
                }
                Command::Destroy => {
                    let upstream = state.lock().upstream().clone();
                    self.table.remove(&circuit_id);
                    send_best_effort(&upstream, frame).await;
                    info!("Circuit {} destroyed from downstream", circuit_id);
                    state.lock().close();
                    return;
                }
                other => debug!("Unexpected {} from downstream of {}", other, circuit_id),
            }
        }

        // Next relay went away: the circuit cannot carry traffic any more
        if let Some(state) = self.table.remove(&circuit_id) {
            let upstream = state.lock().upstream().clone();
            debug!("Downstream of {} closed", circuit_id);
            send_best_effort(&upstream, Frame::new(circuit_id, Cell::destroy())).await;
            state.lock().close();
        }
    }

    fn spawn_destination_reader(
        &self,
        circuit_id: CircuitId,
        stream: Arc<DestinationStream>,
        reader: OwnedReadHalf,
    ) {
        let dispatcher = self.clone();
        let task_stream = stream.clone();
        let handle = tokio::spawn(async move {
            dispatcher.pump_destination(circuit_id, task_stream, reader).await;
        });
        stream.set_reader(handle.abort_handle());
    }

    /// Destination bytes back to the client as DATA; END on EOF
    async fn pump_destination(
        self,
        circuit_id: CircuitId,
        stream: Arc<DestinationStream>,
        mut reader: OwnedReadHalf,
    ) {
        let stream_id = stream.stream_id();
        let mut buf = vec![0u8; EXIT_READ_CHUNK];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("Read from stream {} on {} failed: {}", stream_id, circuit_id, e);
                    break;
                }
            };

            let Some(state) = self.table.find(&circuit_id) else {
                return;
            };
            state.lock().touch();

            let data = DataPayload {
                stream_id,
                data: Bytes::copy_from_slice(&buf[..n]),
            };
            if let Err(e) = self
                .send_sealed_upstream(&state, circuit_id, &data.encode())
                .await
            {
                debug!("Upstream DATA for {} failed: {}", circuit_id, e);
                return;
            }
        }

        if let Some(state) = self.table.find(&circuit_id) {
            let removed = state.lock().remove_stream_if(stream_id, &stream);
            if removed {
                debug!("Stream {} on {} reached EOF", stream_id, circuit_id);
                self.send_end(&state, circuit_id, stream_id).await;
            }
        }
    }

    // ========== Sending ==========

    /// Add this hop's upstream layer and send toward the client.
    ///
    /// The write lock is held across seal and write so nonce order equals
    /// wire order.
    async fn send_sealed_upstream(
        &self,
        state: &SharedConnState,
        circuit_id: CircuitId,
        payload: &[u8],
    ) -> VeilResult<()> {
        let sealed_len = payload.len() + LAYER_OVERHEAD;
        if sealed_len > MAX_PAYLOAD_SIZE {
            state.lock().stats_mut().dropped += 1;
            return Err(VeilError::CellTooLarge(sealed_len, MAX_PAYLOAD_SIZE));
        }

        let upstream = state.lock().upstream().clone();
        let mut writer = upstream.lock_writer().await;

        let sealed = {
            let mut guard = state.lock();
            let sealed = guard
                .crypto_mut()
                .seal(&*self.crypto, MessageClass::UpstreamData, payload)?;
            guard.stats_mut().upstream += 1;
            sealed
        };

        let frame = Frame::new(circuit_id, Cell::new(Command::Data, sealed)?);
        write_frame(&mut *writer, &frame).await
    }

    async fn forward_downstream(
        &self,
        state: &SharedConnState,
        circuit_id: CircuitId,
        cell: Cell,
    ) -> VeilResult<()> {
        let link = {
            let mut guard = state.lock();
            let link = guard.downstream_link();
            if link.is_some() {
                guard.stats_mut().downstream += 1;
            } else {
                guard.stats_mut().dropped += 1;
            }
            link
        };

        match link {
            Some(link) => link.send(&Frame::new(circuit_id, cell)).await,
            None => {
                warn!("No downstream relay for {} on {}", cell.command, circuit_id);
                Ok(())
            }
        }
    }

    async fn send_ack(
        &self,
        state: &SharedConnState,
        circuit_id: CircuitId,
        stream_id: StreamId,
        status: AckStatus,
    ) -> VeilResult<()> {
        let upstream = state.lock().upstream().clone();
        let ack = BeginAckPayload { stream_id, status };
        upstream
            .send(&Frame::new(circuit_id, Cell::new(Command::BeginAck, ack.encode())?))
            .await
    }

    async fn send_end(&self, state: &SharedConnState, circuit_id: CircuitId, stream_id: StreamId) {
        let upstream = state.lock().upstream().clone();
        let end = EndPayload { stream_id };
        match Cell::new(Command::End, end.encode()) {
            Ok(cell) => send_best_effort(&upstream, Frame::new(circuit_id, cell)).await,
            Err(e) => debug!("END for stream {} not built: {}", stream_id, e),
        }
    }
}

#[async_trait]
impl RelayDispatch for CellDispatcher {
    async fn dispatch(&self, upstream: &Arc<Link>, frame: Frame) -> VeilResult<()> {
        let Frame { circuit_id, cell } = frame;

        let Some(state) = self.table.find(&circuit_id) else {
            return match cell.command {
                Command::Extend => self.on_extend_new(upstream, circuit_id, &cell.payload).await,
                other => {
                    debug!("Ignoring {} for unknown circuit {}", other, circuit_id);
                    Ok(())
                }
            };
        };

        {
            let mut guard = state.lock();
            if !Arc::ptr_eq(guard.upstream(), upstream) {
                warn!("{} for {} from foreign link {}", cell.command, circuit_id, upstream.peer());
                return Ok(());
            }
            guard.touch();
        }

        match cell.command {
            Command::Extend => self.forward_downstream(&state, circuit_id, cell).await,
            Command::Begin | Command::Connect => self.on_begin(&state, circuit_id, cell).await,
            Command::Data => self.on_data(&state, circuit_id, &cell.payload).await,
            Command::End => self.on_end(&state, circuit_id, cell).await,
            Command::Destroy => {
                self.on_destroy(circuit_id).await;
                Ok(())
            }
            Command::Created | Command::BeginAck => Err(VeilError::UnexpectedCell(format!(
                "{} from upstream on {}",
                cell.command, circuit_id
            ))),
        }
    }
}

/// Send a teardown or relayed frame; failures are only logged
async fn send_best_effort(link: &Link, frame: Frame) {
    let command = frame.cell.command;
    if let Err(e) = link.send(&frame).await {
        debug!("{} for {} to {} not delivered: {}", command, frame.circuit_id, link.peer(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{wrap_hop_keys, HopCrypto, HopKeys};
    use std::net::SocketAddr;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn link_pair() -> (Arc<Link>, Arc<Link>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(Link::connect(addr), listener.accept());
        (client.unwrap(), Link::from_stream(accepted.unwrap().0).unwrap())
    }

    fn relay(hidden_target: Option<String>) -> CellDispatcher {
        let keys = Arc::new(RelayKeyPair::generate(1024).unwrap());
        CellDispatcher::new(Arc::new(ConnStateTable::new()), keys, hidden_target).unwrap()
    }

    fn cell(command: Command, payload: impl Into<Bytes>) -> Cell {
        Cell::new(command, payload).unwrap()
    }

    /// Run the EXTEND handshake; returns the client's copy of the hop layer
    async fn extend(
        relay: &CellDispatcher,
        client: &Arc<Link>,
        upstream: &Arc<Link>,
        circuit_id: CircuitId,
        next_hop: Option<SocketAddr>,
    ) -> HopCrypto {
        let keys = HopKeys::generate();
        let extend = ExtendPayload {
            next_hop,
            wrapped_keys: wrap_hop_keys(relay.keys.public_key(), &keys).unwrap().into(),
        };
        relay
            .dispatch(upstream, Frame::new(circuit_id, cell(Command::Extend, extend.encode())))
            .await
            .unwrap();

        let created = client.recv().await.unwrap().unwrap();
        assert_eq!(created.cell.command, Command::Created);
        let payload = CreatedPayload::decode(&created.cell.payload).unwrap();
        assert_eq!(payload.public_key, relay.public_key_der);
        HopCrypto::new(keys)
    }

    async fn expect_ack(client: &Arc<Link>) -> BeginAckPayload {
        let frame = client.recv().await.unwrap().unwrap();
        assert_eq!(frame.cell.command, Command::BeginAck);
        BeginAckPayload::decode(&frame.cell.payload).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_circuit_ignores_non_extend() {
        let relay = relay(None);
        let (_client, upstream) = link_pair().await;
        let end = EndPayload { stream_id: 1 };
        relay
            .dispatch(&upstream, Frame::new(CircuitId::generate(), cell(Command::End, end.encode())))
            .await
            .unwrap();
        assert!(relay.table().is_empty());
    }

    #[tokio::test]
    async fn test_bad_wrapped_keys_destroys() {
        let relay = relay(None);
        let (client, upstream) = link_pair().await;
        let id = CircuitId::generate();
        let extend = ExtendPayload {
            next_hop: None,
            wrapped_keys: Bytes::from_static(b"not rsa"),
        };
        relay
            .dispatch(&upstream, Frame::new(id, cell(Command::Extend, extend.encode())))
            .await
            .unwrap();

        let reply = client.recv().await.unwrap().unwrap();
        assert_eq!(reply, Frame::new(id, Cell::destroy()));
        assert!(relay.table().is_empty());
    }

    #[tokio::test]
    async fn test_exit_begin_data_end() {
        let relay = relay(None);
        let (client, upstream) = link_pair().await;
        let id = CircuitId::generate();
        let mut hop = extend(&relay, &client, &upstream, id, None).await;
        let crypto = AeadOnion::new();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let begin = BeginPayload {
            stream_id: 7,
            target: listener.local_addr().unwrap().to_string(),
        };
        let sealed = hop.seal(&crypto, MessageClass::Begin, &begin.encode()).unwrap();
        relay
            .dispatch(&upstream, Frame::new(id, cell(Command::Begin, sealed)))
            .await
            .unwrap();
        let (mut destination, _) = listener.accept().await.unwrap();
        assert_eq!(expect_ack(&client).await.status, AckStatus::Ok);

        // Downstream DATA reaches the destination
        let data = DataPayload { stream_id: 7, data: Bytes::from_static(b"hello") };
        let sealed = hop
            .seal(&crypto, MessageClass::DownstreamData, &data.encode())
            .unwrap();
        relay
            .dispatch(&upstream, Frame::new(id, cell(Command::Data, sealed)))
            .await
            .unwrap();
        let mut buf = [0u8; 5];
        destination.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        // Destination bytes come back under the upstream layer
        destination.write_all(b"pong").await.unwrap();
        let frame = client.recv().await.unwrap().unwrap();
        assert_eq!(frame.cell.command, Command::Data);
        let opened = hop
            .try_open(&crypto, MessageClass::UpstreamData, &frame.cell.payload)
            .unwrap();
        let reply = DataPayload::decode(&opened).unwrap();
        assert_eq!(reply.stream_id, 7);
        assert_eq!(&reply.data[..], b"pong");

        // Destination EOF becomes END for the stream
        drop(destination);
        let frame = client.recv().await.unwrap().unwrap();
        assert_eq!(frame.cell.command, Command::End);
        assert_eq!(EndPayload::decode(&frame.cell.payload).unwrap().stream_id, 7);
        let state = relay.table().find(&id).unwrap();
        assert!(state.lock().stream_writer(7).is_none());
    }

    #[tokio::test]
    async fn test_exit_begin_dial_failure() {
        let relay = relay(None);
        let (client, upstream) = link_pair().await;
        let id = CircuitId::generate();
        let mut hop = extend(&relay, &client, &upstream, id, None).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap().to_string();
        drop(listener);

        let begin = BeginPayload { stream_id: 1, target };
        let sealed = hop
            .seal(&AeadOnion::new(), MessageClass::Begin, &begin.encode())
            .unwrap();
        relay
            .dispatch(&upstream, Frame::new(id, cell(Command::Begin, sealed)))
            .await
            .unwrap();

        let ack = expect_ack(&client).await;
        assert_eq!(ack, BeginAckPayload { stream_id: 1, status: AckStatus::DialFailed });
    }

    #[tokio::test]
    async fn test_exit_connect_without_hidden_service() {
        let relay = relay(None);
        let (client, upstream) = link_pair().await;
        let id = CircuitId::generate();
        let mut hop = extend(&relay, &client, &upstream, id, None).await;

        let sealed = hop
            .seal(&AeadOnion::new(), MessageClass::Begin, &ConnectPayload::hidden_service().encode())
            .unwrap();
        relay
            .dispatch(&upstream, Frame::new(id, cell(Command::Connect, sealed)))
            .await
            .unwrap();

        let ack = expect_ack(&client).await;
        assert_eq!(ack.stream_id, CONTROL_STREAM);
        assert_eq!(ack.status, AckStatus::NoHiddenService);
    }

    #[tokio::test]
    async fn test_exit_connect_hidden_service() {
        let service = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay = relay(Some(service.local_addr().unwrap().to_string()));
        let (client, upstream) = link_pair().await;
        let id = CircuitId::generate();
        let mut hop = extend(&relay, &client, &upstream, id, None).await;
        let crypto = AeadOnion::new();

        let sealed = hop
            .seal(&crypto, MessageClass::Begin, &ConnectPayload::hidden_service().encode())
            .unwrap();
        relay
            .dispatch(&upstream, Frame::new(id, cell(Command::Connect, sealed)))
            .await
            .unwrap();
        let (mut socket, _) = service.accept().await.unwrap();
        assert_eq!(expect_ack(&client).await.status, AckStatus::Ok);

        let data = DataPayload { stream_id: CONTROL_STREAM, data: Bytes::from_static(b"hi") };
        let sealed = hop
            .seal(&crypto, MessageClass::DownstreamData, &data.encode())
            .unwrap();
        relay
            .dispatch(&upstream, Frame::new(id, cell(Command::Data, sealed)))
            .await
            .unwrap();
        let mut buf = [0u8; 2];
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        // END on stream 0 closes the whole circuit
        relay
            .dispatch(&upstream, Frame::new(id, cell(Command::End, EndPayload { stream_id: 0 }.encode())))
            .await
            .unwrap();
        assert!(relay.table().find(&id).is_none());
    }

    #[tokio::test]
    async fn test_exit_rejects_undecryptable_data() {
        let relay = relay(None);
        let (client, upstream) = link_pair().await;
        let id = CircuitId::generate();
        extend(&relay, &client, &upstream, id, None).await;

        let result = relay
            .dispatch(&upstream, Frame::new(id, cell(Command::Data, vec![0u8; 64])))
            .await;
        assert!(matches!(result, Err(VeilError::DecryptionFailed)));
        let state = relay.table().find(&id).unwrap();
        assert_eq!(state.lock().stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_middle_forwards_and_reseals_response() {
        let relay = relay(None);
        let (client, upstream) = link_pair().await;
        let next = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let id = CircuitId::generate();

        let next_addr = next.local_addr().unwrap();
        let (mut hop, accepted) = tokio::join!(
            extend(&relay, &client, &upstream, id, Some(next_addr)),
            next.accept()
        );
        let downstream = Link::from_stream(accepted.unwrap().0).unwrap();
        let crypto = AeadOnion::new();

        // Client DATA loses this hop's layer on the way down
        let sealed = hop
            .seal(&crypto, MessageClass::DownstreamData, b"inner layer")
            .unwrap();
        relay
            .dispatch(&upstream, Frame::new(id, cell(Command::Data, sealed)))
            .await
            .unwrap();
        let forwarded = downstream.recv().await.unwrap().unwrap();
        assert_eq!(&forwarded.cell.payload[..], b"inner layer");

        // Response DATA fails the trial-open and is sealed upstream
        let response = vec![0x5au8; 80];
        downstream
            .send(&Frame::new(id, cell(Command::Data, response.clone())))
            .await
            .unwrap();
        let frame = client.recv().await.unwrap().unwrap();
        assert_eq!(frame.cell.command, Command::Data);
        let opened = hop
            .try_open(&crypto, MessageClass::UpstreamData, &frame.cell.payload)
            .unwrap();
        assert_eq!(opened, response);

        // The failed trial consumed no downstream nonce
        let state = relay.table().find(&id).unwrap();
        assert_eq!(
            state.lock().crypto_mut().counters().get(MessageClass::DownstreamData),
            1
        );

        // Handshake cells from downstream are relayed unmodified
        let ack = BeginAckPayload { stream_id: 3, status: AckStatus::Ok };
        let frame = Frame::new(id, cell(Command::BeginAck, ack.encode()));
        downstream.send(&frame).await.unwrap();
        assert_eq!(client.recv().await.unwrap().unwrap(), frame);
    }

    #[tokio::test]
    async fn test_middle_drops_response_too_large_to_reseal() {
        let relay = relay(None);
        let (client, upstream) = link_pair().await;
        let next = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let id = CircuitId::generate();

        let next_addr = next.local_addr().unwrap();
        let (mut hop, accepted) = tokio::join!(
            extend(&relay, &client, &upstream, id, Some(next_addr)),
            next.accept()
        );
        let downstream = Link::from_stream(accepted.unwrap().0).unwrap();
        let crypto = AeadOnion::new();

        // A full cell has no room for another layer
        downstream
            .send(&Frame::new(id, cell(Command::Data, vec![0x11u8; MAX_PAYLOAD_SIZE])))
            .await
            .unwrap();
        let response = vec![0x22u8; 64];
        downstream
            .send(&Frame::new(id, cell(Command::Data, response.clone())))
            .await
            .unwrap();

        // Only the second response arrives, sealed under the first nonce
        let frame = client.recv().await.unwrap().unwrap();
        let opened = hop
            .try_open(&crypto, MessageClass::UpstreamData, &frame.cell.payload)
            .unwrap();
        assert_eq!(opened, response);

        let state = relay.table().find(&id).unwrap();
        let stats = state.lock().stats();
        assert_eq!(stats.upstream, 1);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn test_destroy_propagates_downstream() {
        let relay = relay(None);
        let (client, upstream) = link_pair().await;
        let next = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let id = CircuitId::generate();

        let next_addr = next.local_addr().unwrap();
        let (_hop, accepted) = tokio::join!(
            extend(&relay, &client, &upstream, id, Some(next_addr)),
            next.accept()
        );
        let downstream = Link::from_stream(accepted.unwrap().0).unwrap();

        relay
            .dispatch(&upstream, Frame::new(id, Cell::destroy()))
            .await
            .unwrap();
        assert!(relay.table().is_empty());
        assert_eq!(
            downstream.recv().await.unwrap(),
            Some(Frame::new(id, Cell::destroy()))
        );
        assert_eq!(downstream.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_downstream_eof_destroys_upstream() {
        let relay = relay(None);
        let (client, upstream) = link_pair().await;
        let next = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let id = CircuitId::generate();

        let next_addr = next.local_addr().unwrap();
        let (_hop, accepted) = tokio::join!(
            extend(&relay, &client, &upstream, id, Some(next_addr)),
            next.accept()
        );
        drop(accepted);

        assert_eq!(
            client.recv().await.unwrap(),
            Some(Frame::new(id, Cell::destroy()))
        );
        assert!(relay.table().find(&id).is_none());
    }
}
