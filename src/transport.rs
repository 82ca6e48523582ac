//! Links and the circuit-build transport
//!
//! A [`Link`] is one TCP connection carrying frames, split into halves
//! behind async locks. Writers that consume nonces hold the write half
//! across seal and write so nonce order equals wire order.

use crate::cell::{read_frame, write_frame, Cell, Command, Frame};
use crate::circuit::CircuitId;
use crate::payload::{CreatedPayload, Payload};
use crate::{VeilError, VeilResult};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, trace};

/// A framed TCP connection
#[derive(Debug)]
pub struct Link {
    peer: SocketAddr,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
}

impl Link {
    /// Dial a relay
    pub async fn connect(addr: SocketAddr) -> VeilResult<Arc<Self>> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| VeilError::DialFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        Self::from_stream(stream)
    }

    /// Wrap an accepted connection
    pub fn from_stream(stream: TcpStream) -> VeilResult<Arc<Self>> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Arc::new(Self {
            peer,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }))
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Send one frame
    pub async fn send(&self, frame: &Frame) -> VeilResult<()> {
        let mut writer = self.writer.lock().await;
        trace!("-> {} {} on {}", self.peer, frame.cell.command, frame.circuit_id);
        write_frame(&mut *writer, frame).await
    }

    /// Receive one frame; `None` once the peer has closed
    pub async fn recv(&self) -> VeilResult<Option<Frame>> {
        let mut reader = self.reader.lock().await;
        read_frame(&mut *reader).await
    }

    /// Exclusive access to the write half
    pub async fn lock_writer(&self) -> MutexGuard<'_, OwnedWriteHalf> {
        self.writer.lock().await
    }

    /// Close the write direction; the peer's reader sees end of stream
    pub async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Shutdown of link to {} failed: {}", self.peer, e);
        }
    }
}

/// Client-side operations used while telescoping a circuit
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a link to the entry relay
    async fn dial(&self, addr: SocketAddr) -> VeilResult<Arc<Link>>;

    /// Send a cell on the circuit
    async fn send_cell(&self, link: &Link, circuit_id: CircuitId, cell: Cell) -> VeilResult<()>;

    /// Wait for the CREATED answering the last EXTEND
    async fn wait_ack(&self, link: &Link, circuit_id: CircuitId) -> VeilResult<CreatedPayload>;

    /// Best-effort DESTROY
    async fn send_destroy(&self, link: &Link, circuit_id: CircuitId);
}

/// Plain TCP transport
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(&self, addr: SocketAddr) -> VeilResult<Arc<Link>> {
        Link::connect(addr).await
    }

    async fn send_cell(&self, link: &Link, circuit_id: CircuitId, cell: Cell) -> VeilResult<()> {
        link.send(&Frame::new(circuit_id, cell)).await
    }

    async fn wait_ack(&self, link: &Link, circuit_id: CircuitId) -> VeilResult<CreatedPayload> {
        loop {
            let frame = link.recv().await?.ok_or(VeilError::ConnectionClosed)?;
            if frame.circuit_id != circuit_id {
                debug!("Ignoring {} for foreign circuit {}", frame.cell.command, frame.circuit_id);
                continue;
            }

            return match frame.cell.command {
                Command::Created => CreatedPayload::decode(&frame.cell.payload),
                Command::Destroy => Err(VeilError::CircuitBuildFailed(format!(
                    "relay path from {} destroyed the circuit",
                    link.peer()
                ))),
                other => Err(VeilError::UnexpectedCell(format!(
                    "{} while waiting for CREATED",
                    other
                ))),
            };
        }
    }

    async fn send_destroy(&self, link: &Link, circuit_id: CircuitId) {
        if let Err(e) = link.send(&Frame::new(circuit_id, Cell::destroy())).await {
            debug!("DESTROY for {} not delivered: {}", circuit_id, e);
        }
    }
}
