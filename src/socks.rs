//! SOCKS5 Front End
//!
//! A minimal RFC 1928 listener: no authentication, CONNECT only, with
//! IPv4, IPv6 and domain targets.
//!
//! Ordinary targets share one circuit and get a fresh stream (BEGIN) per
//! connection. `.veil` targets get a dedicated circuit ending at the exit
//! that hosts the service, attached with an empty CONNECT.

use crate::circuit::{CircuitId, StreamId, CONTROL_STREAM};
use crate::client::{StreamEvent, VeilClient};
use crate::hidden::HiddenAddress;
use crate::payload::AckStatus;
use crate::{VeilError, VeilResult};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const SOCKS_VERSION: u8 = 5;

const NO_AUTH: u8 = 0x00;
const NO_ACCEPTABLE_METHOD: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Bytes read from the application per `send_data`
const APP_READ_CHUNK: usize = 4096;

/// SOCKS5 reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    /// Reply for a failure before the exit answered
    pub fn from_error(error: &VeilError) -> Self {
        match error {
            VeilError::NotEnoughRelays { .. }
            | VeilError::RelayNotFound(_)
            | VeilError::DialFailed { .. }
            | VeilError::CircuitBuildFailed(_) => Reply::NetworkUnreachable,
            VeilError::HiddenServiceNotFound(_) | VeilError::InvalidAddress(_) => {
                Reply::HostUnreachable
            }
            VeilError::StreamRejected(..) => Reply::NotAllowed,
            _ => Reply::GeneralFailure,
        }
    }

    /// Reply for the exit's BEGINACK status
    pub fn from_status(status: AckStatus) -> Self {
        match status {
            AckStatus::Ok => Reply::Succeeded,
            AckStatus::DialFailed => Reply::ConnectionRefused,
            AckStatus::NoHiddenService => Reply::HostUnreachable,
            AckStatus::Rejected => Reply::NotAllowed,
        }
    }
}

/// A parsed CONNECT request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
    pub host: String,
    pub port: u16,
}

impl SocksRequest {
    /// "host:port" as sent in BEGIN
    pub fn target(&self) -> String {
        if self.host.parse::<Ipv6Addr>().is_ok() {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn is_hidden(&self) -> bool {
        HiddenAddress::is_hidden_host(&self.host)
    }
}

/// Run the method negotiation and read the request
pub async fn negotiate<S>(stream: &mut S) -> VeilResult<SocksRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    if greeting[0] != SOCKS_VERSION {
        return Err(VeilError::InvalidPayload(format!(
            "SOCKS version {}",
            greeting[0]
        )));
    }
    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, NO_ACCEPTABLE_METHOD])
            .await?;
        return Err(VeilError::InvalidPayload(
            "SOCKS client requires authentication".into(),
        ));
    }
    stream.write_all(&[SOCKS_VERSION, NO_AUTH]).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(VeilError::InvalidPayload(format!(
            "SOCKS version {} in request",
            header[0]
        )));
    }

    let host = match header[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name)
                .map_err(|_| VeilError::InvalidAddress("non UTF-8 host name".into()))?
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        other => {
            write_reply(stream, Reply::AddressTypeNotSupported).await?;
            return Err(VeilError::InvalidPayload(format!(
                "SOCKS address type {}",
                other
            )));
        }
    };
    let port = stream.read_u16().await?;

    if header[1] != CMD_CONNECT {
        write_reply(stream, Reply::CommandNotSupported).await?;
        return Err(VeilError::InvalidPayload(format!(
            "SOCKS command {}",
            header[1]
        )));
    }

    Ok(SocksRequest { host, port })
}

/// Reply with an unspecified bound address
pub async fn write_reply<W>(stream: &mut W, reply: Reply) -> VeilResult<()>
where
    W: AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS_VERSION, reply as u8, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    stream.flush().await?;
    Ok(())
}

/// A stream opened on behalf of one SOCKS connection
struct Tunnel {
    circuit_id: CircuitId,
    stream_id: StreamId,
    events: mpsc::Receiver<StreamEvent>,
    /// Hidden-service tunnels own their circuit
    dedicated: bool,
}

struct SocksContext {
    client: Arc<VeilClient>,
    hops: usize,
    shared: tokio::sync::Mutex<Option<CircuitId>>,
}

impl SocksContext {
    /// Circuit shared by ordinary streams, rebuilt when it dies
    async fn shared_circuit(&self) -> VeilResult<CircuitId> {
        let mut current = self.shared.lock().await;
        if let Some(id) = *current {
            if self.client.is_alive(&id) {
                return Ok(id);
            }
        }
        let id = self.client.build_circuit(self.hops, None).await?;
        *current = Some(id);
        Ok(id)
    }

    async fn open(&self, request: &SocksRequest) -> VeilResult<Tunnel> {
        if request.is_hidden() {
            let address = HiddenAddress::parse(&request.host)?;
            let exit = self.client.resolve_hidden(&address)?;
            let circuit_id = self.client.build_circuit(self.hops, Some(exit)).await?;
            return match self.client.connect(circuit_id, "").await {
                Ok(events) => Ok(Tunnel {
                    circuit_id,
                    stream_id: CONTROL_STREAM,
                    events,
                    dedicated: true,
                }),
                Err(e) => {
                    let _ = self.client.destroy_circuit(circuit_id).await;
                    Err(e)
                }
            };
        }

        let circuit_id = self.shared_circuit().await?;
        let stream_id = self.client.open_stream(circuit_id)?;
        let events = self.client.subscribe(circuit_id, stream_id)?;
        if let Err(e) = self
            .client
            .send_begin(circuit_id, stream_id, &request.target())
            .await
        {
            let _ = self.client.close_stream(circuit_id, stream_id).await;
            return Err(e);
        }
        Ok(Tunnel {
            circuit_id,
            stream_id,
            events,
            dedicated: false,
        })
    }

    async fn release(&self, tunnel: &Tunnel) {
        let result = if tunnel.dedicated {
            self.client.destroy_circuit(tunnel.circuit_id).await
        } else {
            self.client
                .close_stream(tunnel.circuit_id, tunnel.stream_id)
                .await
        };
        if let Err(e) = result {
            debug!("Releasing stream {} on {}: {}", tunnel.stream_id, tunnel.circuit_id, e);
        }
    }
}

/// SOCKS5 listener feeding a [`VeilClient`]
pub struct SocksServer {
    listener: TcpListener,
    context: Arc<SocksContext>,
}

impl SocksServer {
    pub async fn bind(addr: SocketAddr, client: Arc<VeilClient>, hops: usize) -> VeilResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("SOCKS5 listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            context: Arc::new(SocksContext {
                client,
                hops,
                shared: tokio::sync::Mutex::new(None),
            }),
        })
    }

    pub fn local_addr(&self) -> VeilResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> VeilResult<()> {
        loop {
            match self.listener.accept().await {
                Ok((socket, peer)) => {
                    debug!("SOCKS connection from {}", peer);
                    tokio::spawn(handle_connection(self.context.clone(), socket));
                }
                Err(e) => {
                    error!("SOCKS accept failed: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<VeilResult<()>> {
        tokio::spawn(self.run())
    }
}

async fn handle_connection(context: Arc<SocksContext>, mut socket: TcpStream) {
    let request = match negotiate(&mut socket).await {
        Ok(request) => request,
        Err(e) => {
            debug!("SOCKS negotiation failed: {}", e);
            return;
        }
    };

    let mut tunnel = match context.open(&request).await {
        Ok(tunnel) => tunnel,
        Err(e) => {
            warn!("Cannot reach {}: {}", request.target(), e);
            let _ = write_reply(&mut socket, Reply::from_error(&e)).await;
            return;
        }
    };

    let reply = match tunnel.events.recv().await {
        Some(StreamEvent::Connected) => Reply::Succeeded,
        Some(StreamEvent::Rejected(status)) => Reply::from_status(status),
        _ => Reply::GeneralFailure,
    };
    if write_reply(&mut socket, reply).await.is_err() || reply != Reply::Succeeded {
        if reply != Reply::Succeeded {
            info!("Exit refused {}: {:?}", request.target(), reply);
        }
        context.release(&tunnel).await;
        return;
    }
    debug!(
        "{} tunnelled on stream {} of {}",
        request.target(),
        tunnel.stream_id,
        tunnel.circuit_id
    );

    pump(&context.client, &mut tunnel, socket).await;
    context.release(&tunnel).await;
}

/// Copy application bytes into the circuit and stream events back out
/// until either side closes
async fn pump(client: &VeilClient, tunnel: &mut Tunnel, socket: TcpStream) {
    let (mut reader, mut writer) = socket.into_split();
    let (circuit_id, stream_id) = (tunnel.circuit_id, tunnel.stream_id);
    let events = &mut tunnel.events;

    let outbound = async {
        let mut buf = vec![0u8; APP_READ_CHUNK];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if let Err(e) = client.send_data(circuit_id, stream_id, &buf[..n]).await {
                debug!("Stream {} on {}: {}", stream_id, circuit_id, e);
                break;
            }
        }
    };

    let inbound = async {
        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::Data(bytes) => {
                    if writer.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                StreamEvent::Connected => {}
                StreamEvent::Rejected(_) | StreamEvent::Closed => break,
            }
        }
        let _ = writer.shutdown().await;
    };

    // Each cell is sealed and written on its own task, so dropping
    // `outbound` never leaves a committed nonce off the wire
    tokio::select! {
        _ = outbound => {}
        _ = inbound => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_negotiate_ipv4() {
        let (mut app, mut proxy) = duplex(256);
        app.write_all(&[5, 1, 0]).await.unwrap();
        app.write_all(&[5, 1, 0, 1, 127, 0, 0, 1, 0x1f, 0x90]).await.unwrap();

        let request = negotiate(&mut proxy).await.unwrap();
        assert_eq!(request.host, "127.0.0.1");
        assert_eq!(request.port, 8080);
        assert_eq!(request.target(), "127.0.0.1:8080");

        let mut method = [0u8; 2];
        app.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [5, 0]);
    }

    #[tokio::test]
    async fn test_negotiate_domain_and_ipv6() {
        let (mut app, mut proxy) = duplex(256);
        app.write_all(&[5, 2, 2, 0]).await.unwrap();
        let mut request = vec![5, 1, 0, 3, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&443u16.to_be_bytes());
        app.write_all(&request).await.unwrap();
        let parsed = negotiate(&mut proxy).await.unwrap();
        assert_eq!(parsed.target(), "example.com:443");
        assert!(!parsed.is_hidden());

        let (mut app, mut proxy) = duplex(256);
        app.write_all(&[5, 1, 0]).await.unwrap();
        let mut request = vec![5, 1, 0, 4];
        request.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        request.extend_from_slice(&80u16.to_be_bytes());
        app.write_all(&request).await.unwrap();
        assert_eq!(negotiate(&mut proxy).await.unwrap().target(), "[::1]:80");
    }

    #[tokio::test]
    async fn test_negotiate_rejects_bind() {
        let (mut app, mut proxy) = duplex(256);
        app.write_all(&[5, 1, 0]).await.unwrap();
        app.write_all(&[5, 2, 0, 1, 10, 0, 0, 1, 0, 80]).await.unwrap();
        assert!(negotiate(&mut proxy).await.is_err());

        let mut replies = [0u8; 12];
        app.read_exact(&mut replies).await.unwrap();
        assert_eq!(&replies[..2], &[5, 0]);
        assert_eq!(replies[3], Reply::CommandNotSupported as u8);
    }

    #[tokio::test]
    async fn test_negotiate_requires_no_auth() {
        let (mut app, mut proxy) = duplex(256);
        app.write_all(&[5, 1, 2]).await.unwrap();
        assert!(negotiate(&mut proxy).await.is_err());

        let mut reply = [0u8; 2];
        app.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, NO_ACCEPTABLE_METHOD]);
    }

    #[test]
    fn test_reply_mapping() {
        assert_eq!(
            Reply::from_error(&VeilError::NotEnoughRelays { requested: 3, available: 0 }),
            Reply::NetworkUnreachable
        );
        assert_eq!(
            Reply::from_error(&VeilError::HiddenServiceNotFound("x.veil".into())),
            Reply::HostUnreachable
        );
        assert_eq!(Reply::from_status(AckStatus::DialFailed), Reply::ConnectionRefused);
        assert_eq!(Reply::from_status(AckStatus::Ok), Reply::Succeeded);
    }

    #[test]
    fn test_hidden_request() {
        let host = HiddenAddress::from_public_key(b"svc").to_string();
        let request = SocksRequest { host, port: 80 };
        assert!(request.is_hidden());
    }
}
