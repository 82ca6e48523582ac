//! Relay Server
//!
//! Accept loop for a relay. Each inbound connection gets one reader loop
//! that hands frames to the dispatcher in order; the idle sweeper runs
//! alongside.

use crate::config::RelayConfig;
use crate::conn_state::{close_downstream, ConnStateTable};
use crate::crypto::RelayKeyPair;
use crate::dispatch::{CellDispatcher, RelayDispatch};
use crate::relay::{RelayDescriptor, RelayId};
use crate::transport::Link;
use crate::VeilResult;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A listening relay
pub struct RelayServer {
    listener: TcpListener,
    dispatcher: CellDispatcher,
    keys: Arc<RelayKeyPair>,
    nickname: String,
    idle_ttl: Duration,
}

impl RelayServer {
    /// Bind the relay listener
    pub async fn bind(
        listen_addr: SocketAddr,
        config: &RelayConfig,
        keys: RelayKeyPair,
    ) -> VeilResult<Self> {
        config.validate()?;
        let listener = TcpListener::bind(listen_addr).await?;
        let keys = Arc::new(keys);
        let dispatcher = CellDispatcher::new(
            Arc::new(ConnStateTable::new()),
            keys.clone(),
            config.hidden_service_target.clone(),
        )?;

        info!(
            "Relay {} ({}) listening on {}",
            config.nickname,
            keys.relay_id()?,
            listener.local_addr()?
        );

        Ok(Self {
            listener,
            dispatcher,
            keys,
            nickname: config.nickname.clone(),
            idle_ttl: config.idle_ttl,
        })
    }

    pub fn local_addr(&self) -> VeilResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn relay_id(&self) -> VeilResult<RelayId> {
        self.keys.relay_id()
    }

    /// Directory entry advertising this relay at its bound address
    pub fn descriptor(&self) -> VeilResult<RelayDescriptor> {
        RelayDescriptor::from_key_pair(&self.keys, self.nickname.clone(), self.local_addr()?)
    }

    pub fn table(&self) -> Arc<ConnStateTable> {
        self.dispatcher.table().clone()
    }

    /// Accept connections until the listener fails
    pub async fn run(self) -> VeilResult<()> {
        let sweeper = self.table().spawn_sweeper(self.idle_ttl);

        let result = loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let link = match Link::from_stream(stream) {
                        Ok(link) => link,
                        Err(e) => {
                            warn!("Rejecting connection from {}: {}", peer, e);
                            continue;
                        }
                    };
                    debug!("Connection from {}", peer);
                    let dispatcher = self.dispatcher.clone();
                    tokio::spawn(serve_connection(dispatcher, link));
                }
                Err(e) => {
                    error!("Accept failed: {}", e);
                    break Err(e.into());
                }
            }
        };

        sweeper.abort();
        result
    }

    /// Run on a background task
    pub fn spawn(self) -> JoinHandle<VeilResult<()>> {
        tokio::spawn(self.run())
    }
}

/// Read frames from one inbound connection until it closes
async fn serve_connection(dispatcher: CellDispatcher, link: Arc<Link>) {
    loop {
        let frame = match link.recv().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!("Dropping connection from {}: {}", link.peer(), e);
                break;
            }
        };

        if let Err(e) = dispatcher.dispatch(&link, frame).await {
            if e.is_protocol_error() {
                warn!("Protocol error from {}: {}", link.peer(), e);
                break;
            }
            debug!("Cell from {} not handled: {}", link.peer(), e);
        }
    }

    // Circuits arriving over this connection have no way back
    let orphaned = dispatcher.table().remove_by_upstream(&link);
    if !orphaned.is_empty() {
        info!("Closing {} circuits from {}", orphaned.len(), link.peer());
    }
    for state in orphaned {
        close_downstream(&state).await;
    }
    link.shutdown().await;
    debug!("Connection from {} closed", link.peer());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{Cell, Command, Frame};
    use crate::circuit::CircuitId;
    use crate::crypto::{wrap_hop_keys, HopKeys};
    use crate::payload::{CreatedPayload, ExtendPayload, Payload};

    #[tokio::test]
    async fn test_relay_answers_extend() {
        let keys = RelayKeyPair::generate(1024).unwrap();
        let public = keys.public_key().clone();
        let server = RelayServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            &RelayConfig::default(),
            keys,
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let descriptor = server.descriptor().unwrap();
        let table = server.table();
        let handle = server.spawn();

        let link = Link::connect(addr).await.unwrap();
        let id = CircuitId::generate();
        let extend = ExtendPayload {
            next_hop: None,
            wrapped_keys: wrap_hop_keys(&public, &HopKeys::generate()).unwrap().into(),
        };
        link.send(&Frame::new(id, Cell::new(Command::Extend, extend.encode()).unwrap()))
            .await
            .unwrap();

        let reply = link.recv().await.unwrap().unwrap();
        assert_eq!(reply.cell.command, Command::Created);
        let created = CreatedPayload::decode(&reply.cell.payload).unwrap();
        assert_eq!(created.public_key.to_vec(), descriptor.public_key);
        assert_eq!(table.len(), 1);

        // Closing the client connection releases its circuits
        link.shutdown().await;
        for _ in 0..100 {
            if table.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(table.is_empty());
        handle.abort();
    }

    #[tokio::test]
    async fn test_protocol_error_drops_connection() {
        let keys = RelayKeyPair::generate(1024).unwrap();
        let server = RelayServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            &RelayConfig::default(),
            keys,
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.spawn();

        let link = Link::connect(addr).await.unwrap();
        let mut raw = vec![0u8; crate::FRAME_SIZE];
        raw[crate::CIRCUIT_ID_SIZE] = 0xee;
        {
            use tokio::io::AsyncWriteExt;
            let mut writer = link.lock_writer().await;
            writer.write_all(&raw).await.unwrap();
        }

        assert_eq!(link.recv().await.unwrap(), None);
        handle.abort();
    }
}
