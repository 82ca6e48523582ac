//! Payload sub-encodings
//!
//! Each command carries its own small binary structure inside the cell
//! payload. All integers are big-endian and variable-length fields carry a
//! `u16` length prefix.
//!
//! | Command  | Payload              | Layout                                   |
//! |----------|----------------------|------------------------------------------|
//! | EXTEND   | [`ExtendPayload`]    | `addr_len(2) addr wrapped_len(2) wrapped`|
//! | CREATED  | [`CreatedPayload`]   | `key_len(2) key`                         |
//! | BEGIN    | [`BeginPayload`]     | `stream(2) target_len(2) target`         |
//! | CONNECT  | [`ConnectPayload`]   | `target_len(2) target`                   |
//! | BEGINACK | [`BeginAckPayload`]  | `stream(2) status(1)`                    |
//! | DATA     | [`DataPayload`]      | `stream(2) data_len(2) data`             |
//! | END      | [`EndPayload`]       | `stream(2)`                              |

use crate::circuit::StreamId;
use crate::{VeilError, VeilResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::SocketAddr;

/// Fixed header of a DATA payload: stream id + data length
pub const DATA_HEADER_SIZE: usize = 4;

/// Binary encoding shared by every payload type
pub trait Payload: Sized {
    /// Encode to bytes
    fn encode(&self) -> Bytes;

    /// Decode from bytes; trailing bytes are rejected
    fn decode(data: &[u8]) -> VeilResult<Self>;
}

fn put_field(buf: &mut BytesMut, field: &[u8]) {
    buf.put_u16(field.len() as u16);
    buf.put_slice(field);
}

fn get_u16(buf: &mut &[u8], what: &str) -> VeilResult<u16> {
    if buf.remaining() < 2 {
        return Err(VeilError::InvalidPayload(format!("{} truncated", what)));
    }
    Ok(buf.get_u16())
}

fn get_field(buf: &mut &[u8], what: &str) -> VeilResult<Bytes> {
    let len = get_u16(buf, what)? as usize;
    if buf.remaining() < len {
        return Err(VeilError::InvalidPayload(format!(
            "{} truncated: expected {} bytes, got {}",
            what,
            len,
            buf.remaining()
        )));
    }
    Ok(buf.copy_to_bytes(len))
}

fn get_string(buf: &mut &[u8], what: &str) -> VeilResult<String> {
    let raw = get_field(buf, what)?;
    String::from_utf8(raw.to_vec())
        .map_err(|_| VeilError::InvalidPayload(format!("{} is not UTF-8", what)))
}

fn finish(buf: &[u8], what: &str) -> VeilResult<()> {
    if buf.is_empty() {
        Ok(())
    } else {
        Err(VeilError::InvalidPayload(format!(
            "{} trailing bytes after {}",
            buf.len(),
            what
        )))
    }
}

/// EXTEND: next hop address plus the RSA-wrapped hop keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendPayload {
    /// `None` when the receiving relay becomes the exit
    pub next_hop: Option<SocketAddr>,
    pub wrapped_keys: Bytes,
}

impl Payload for ExtendPayload {
    fn encode(&self) -> Bytes {
        let addr = self.next_hop.map(|a| a.to_string()).unwrap_or_default();
        let mut buf = BytesMut::with_capacity(4 + addr.len() + self.wrapped_keys.len());
        put_field(&mut buf, addr.as_bytes());
        put_field(&mut buf, &self.wrapped_keys);
        buf.freeze()
    }

    fn decode(data: &[u8]) -> VeilResult<Self> {
        let mut buf = data;
        let addr = get_string(&mut buf, "next hop")?;
        let wrapped_keys = get_field(&mut buf, "wrapped keys")?;
        finish(buf, "EXTEND")?;

        let next_hop = if addr.is_empty() {
            None
        } else {
            Some(
                addr.parse()
                    .map_err(|_| VeilError::InvalidAddress(addr.clone()))?,
            )
        };

        Ok(Self { next_hop, wrapped_keys })
    }
}

/// CREATED: the answering relay's PKCS#1 DER public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedPayload {
    pub public_key: Bytes,
}

impl Payload for CreatedPayload {
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.public_key.len());
        put_field(&mut buf, &self.public_key);
        buf.freeze()
    }

    fn decode(data: &[u8]) -> VeilResult<Self> {
        let mut buf = data;
        let public_key = get_field(&mut buf, "public key")?;
        finish(buf, "CREATED")?;
        Ok(Self { public_key })
    }
}

/// BEGIN: open `stream_id` to `target` ("host:port")
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginPayload {
    pub stream_id: StreamId,
    pub target: String,
}

impl Payload for BeginPayload {
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.target.len());
        buf.put_u16(self.stream_id);
        put_field(&mut buf, self.target.as_bytes());
        buf.freeze()
    }

    fn decode(data: &[u8]) -> VeilResult<Self> {
        let mut buf = data;
        let stream_id = get_u16(&mut buf, "stream id")?;
        let target = get_string(&mut buf, "target")?;
        finish(buf, "BEGIN")?;
        Ok(Self { stream_id, target })
    }
}

/// CONNECT: attach the exit to `target`; empty means the hidden service
/// hosted behind the exit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPayload {
    pub target: String,
}

impl ConnectPayload {
    pub fn hidden_service() -> Self {
        Self { target: String::new() }
    }

    pub fn is_hidden_service(&self) -> bool {
        self.target.is_empty()
    }
}

impl Payload for ConnectPayload {
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.target.len());
        put_field(&mut buf, self.target.as_bytes());
        buf.freeze()
    }

    fn decode(data: &[u8]) -> VeilResult<Self> {
        let mut buf = data;
        let target = get_string(&mut buf, "target")?;
        finish(buf, "CONNECT")?;
        Ok(Self { target })
    }
}

/// Outcome of a BEGIN or CONNECT at the exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckStatus {
    Ok = 0,
    DialFailed = 1,
    NoHiddenService = 2,
    Rejected = 3,
}

impl AckStatus {
    pub fn is_ok(self) -> bool {
        self == AckStatus::Ok
    }
}

impl TryFrom<u8> for AckStatus {
    type Error = VeilError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AckStatus::Ok),
            1 => Ok(AckStatus::DialFailed),
            2 => Ok(AckStatus::NoHiddenService),
            3 => Ok(AckStatus::Rejected),
            _ => Err(VeilError::InvalidPayload(format!("unknown ack status {}", value))),
        }
    }
}

impl fmt::Display for AckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckStatus::Ok => write!(f, "ok"),
            AckStatus::DialFailed => write!(f, "destination unreachable"),
            AckStatus::NoHiddenService => write!(f, "no hidden service at exit"),
            AckStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// BEGINACK: answer to BEGIN (named stream) or CONNECT (stream 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginAckPayload {
    pub stream_id: StreamId,
    pub status: AckStatus,
}

impl Payload for BeginAckPayload {
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(3);
        buf.put_u16(self.stream_id);
        buf.put_u8(self.status as u8);
        buf.freeze()
    }

    fn decode(data: &[u8]) -> VeilResult<Self> {
        let mut buf = data;
        let stream_id = get_u16(&mut buf, "stream id")?;
        if buf.remaining() < 1 {
            return Err(VeilError::InvalidPayload("ack status truncated".into()));
        }
        let status = AckStatus::try_from(buf.get_u8())?;
        finish(buf, "BEGINACK")?;
        Ok(Self { stream_id, status })
    }
}

/// DATA: bytes for one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPayload {
    pub stream_id: StreamId,
    pub data: Bytes,
}

impl Payload for DataPayload {
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(DATA_HEADER_SIZE + self.data.len());
        buf.put_u16(self.stream_id);
        put_field(&mut buf, &self.data);
        buf.freeze()
    }

    fn decode(data: &[u8]) -> VeilResult<Self> {
        let mut buf = data;
        let stream_id = get_u16(&mut buf, "stream id")?;
        let data = get_field(&mut buf, "data")?;
        finish(buf, "DATA")?;
        Ok(Self { stream_id, data })
    }
}

/// END: close `stream_id` (0 closes the circuit at the exit)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndPayload {
    pub stream_id: StreamId,
}

impl Payload for EndPayload {
    fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.stream_id.to_be_bytes())
    }

    fn decode(data: &[u8]) -> VeilResult<Self> {
        let mut buf = data;
        let stream_id = get_u16(&mut buf, "stream id")?;
        finish(buf, "END")?;
        Ok(Self { stream_id })
    }
}
