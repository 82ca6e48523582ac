//! Cell Protocol
//!
//! Fixed-size cells. Every cell on the wire is exactly [`CELL_SIZE`] bytes
//! regardless of how much payload it carries, and is prefixed by the raw
//! bytes of its circuit id.
//!
//! # Frame Format
//!
//! ```text
//! +-----------------+--------+--------+---------+----------------+-------------+
//! | Circuit ID (16) | Cmd(1) | Ver(1) | Len(2)  | Payload (Len)  | Pad (rand)  |
//! +-----------------+--------+--------+---------+----------------+-------------+
//!                   |<------------------- 512 bytes ----------------------->|
//! |<------------------------------ 528 bytes ------------------------------->|
//! ```
//!
//! Padding is filled from the OS random source so that unused payload space
//! is indistinguishable from ciphertext.

use crate::circuit::CircuitId;
use crate::{
    VeilError, VeilResult, CELL_SIZE, CIRCUIT_ID_SIZE, FRAME_SIZE, MAX_PAYLOAD_SIZE,
    PROTOCOL_VERSION,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Cell command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Extend the circuit by one hop (wrapped hop keys)
    Extend = 0x01,
    /// Attach the exit to a destination or hidden service
    Connect = 0x02,
    /// Stream data
    Data = 0x03,
    /// Close a stream (stream 0 closes the circuit)
    End = 0x04,
    /// Tear down the circuit
    Destroy = 0x05,
    /// Open a stream at the exit
    Begin = 0x06,
    /// Exit's answer to BEGIN / CONNECT
    BeginAck = 0x07,
    /// Handshake acknowledgement of EXTEND
    Created = 0x08,
}

impl TryFrom<u8> for Command {
    type Error = VeilError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Extend),
            0x02 => Ok(Command::Connect),
            0x03 => Ok(Command::Data),
            0x04 => Ok(Command::End),
            0x05 => Ok(Command::Destroy),
            0x06 => Ok(Command::Begin),
            0x07 => Ok(Command::BeginAck),
            0x08 => Ok(Command::Created),
            _ => Err(VeilError::UnknownCommand(value)),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Extend => "EXTEND",
            Command::Connect => "CONNECT",
            Command::Data => "DATA",
            Command::End => "END",
            Command::Destroy => "DESTROY",
            Command::Begin => "BEGIN",
            Command::BeginAck => "BEGINACK",
            Command::Created => "CREATED",
        };
        f.write_str(name)
    }
}

/// A VeilNet cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Cell command
    pub command: Command,
    /// Protocol version
    pub version: u8,
    /// Payload (without padding)
    pub payload: Bytes,
}

impl Cell {
    /// Create a new cell with the current protocol version
    pub fn new(command: Command, payload: impl Into<Bytes>) -> VeilResult<Self> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(VeilError::CellTooLarge(payload.len(), MAX_PAYLOAD_SIZE));
        }
        Ok(Self {
            command,
            version: PROTOCOL_VERSION,
            payload,
        })
    }

    /// Create a DESTROY cell
    pub fn destroy() -> Self {
        Self {
            command: Command::Destroy,
            version: PROTOCOL_VERSION,
            payload: Bytes::new(),
        }
    }

    /// Encode cell to exactly [`CELL_SIZE`] bytes
    pub fn encode(&self) -> VeilResult<Bytes> {
        let mut buf = BytesMut::with_capacity(CELL_SIZE);
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    fn encode_into(&self, buf: &mut BytesMut) -> VeilResult<()> {
        let len = self.payload.len();
        if len > MAX_PAYLOAD_SIZE {
            return Err(VeilError::CellTooLarge(len, MAX_PAYLOAD_SIZE));
        }

        buf.put_u8(self.command as u8);
        buf.put_u8(self.version);
        buf.put_u16(len as u16);
        buf.put_slice(&self.payload);

        let mut padding = vec![0u8; MAX_PAYLOAD_SIZE - len];
        OsRng.fill_bytes(&mut padding);
        buf.put_slice(&padding);

        Ok(())
    }

    /// Decode cell from exactly [`CELL_SIZE`] bytes
    pub fn decode(data: &[u8]) -> VeilResult<Self> {
        if data.len() != CELL_SIZE {
            return Err(VeilError::InvalidCellSize {
                expected: CELL_SIZE,
                actual: data.len(),
            });
        }

        let mut buf = data;
        let command = buf.get_u8();
        let version = buf.get_u8();
        let len = buf.get_u16() as usize;

        if version != PROTOCOL_VERSION {
            return Err(VeilError::ProtocolVersionMismatch(PROTOCOL_VERSION, version));
        }
        if len > MAX_PAYLOAD_SIZE {
            return Err(VeilError::CellTooLarge(len, MAX_PAYLOAD_SIZE));
        }
        let command = Command::try_from(command)?;

        Ok(Self {
            command,
            version,
            payload: Bytes::copy_from_slice(&buf[..len]),
        })
    }
}

/// A cell together with the circuit it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub circuit_id: CircuitId,
    pub cell: Cell,
}

impl Frame {
    pub fn new(circuit_id: CircuitId, cell: Cell) -> Self {
        Self { circuit_id, cell }
    }

    /// Encode frame to exactly [`FRAME_SIZE`] bytes
    pub fn encode(&self) -> VeilResult<Bytes> {
        let mut buf = BytesMut::with_capacity(FRAME_SIZE);
        buf.put_slice(self.circuit_id.as_bytes());
        self.cell.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode frame from exactly [`FRAME_SIZE`] bytes
    pub fn decode(data: &[u8]) -> VeilResult<Self> {
        if data.len() != FRAME_SIZE {
            return Err(VeilError::InvalidCellSize {
                expected: FRAME_SIZE,
                actual: data.len(),
            });
        }

        let (id, cell) = data.split_at(CIRCUIT_ID_SIZE);
        let mut raw = [0u8; CIRCUIT_ID_SIZE];
        raw.copy_from_slice(id);

        Ok(Self {
            circuit_id: CircuitId::from_bytes(raw),
            cell: Cell::decode(cell)?,
        })
    }
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> VeilResult<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; FRAME_SIZE];
    match reader.read_exact(&mut buf).await {
        Ok(_) => Frame::decode(&buf).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write one frame and flush
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> VeilResult<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = frame.encode()?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}
