//! End-to-end circuits over loopback relays

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use veilnet::config::{CircuitConfig, RelayConfig};
use veilnet::conn_state::ConnStateTable;
use veilnet::hidden::HiddenServiceRecord;
use veilnet::prelude::*;
use veilnet::socks::SocksServer;

const WAIT: Duration = Duration::from_secs(10);

struct TestRelay {
    descriptor: RelayDescriptor,
    table: Arc<ConnStateTable>,
}

async fn spawn_relay(
    nickname: &str,
    idle_ttl: Duration,
    hidden_service_target: Option<String>,
) -> TestRelay {
    let config = RelayConfig {
        nickname: nickname.to_string(),
        idle_ttl,
        key_bits: 1024,
        hidden_service_target,
        ..RelayConfig::default()
    };
    let keys = RelayKeyPair::generate(1024).unwrap();
    let server = RelayServer::bind("127.0.0.1:0".parse().unwrap(), &config, keys)
        .await
        .unwrap();
    let relay = TestRelay {
        descriptor: server.descriptor().unwrap(),
        table: server.table(),
    };
    server.spawn();
    relay
}

async fn spawn_relays(count: usize, idle_ttl: Duration) -> Vec<TestRelay> {
    let mut relays = Vec::with_capacity(count);
    for i in 0..count {
        relays.push(spawn_relay(&format!("relay{}", i), idle_ttl, None).await);
    }
    relays
}

struct TestClient {
    client: Arc<VeilClient>,
    circuits: Arc<InMemoryCircuitRepository>,
}

fn client_for(relays: &[TestRelay], hidden: InMemoryHiddenServiceRepository) -> TestClient {
    let directory =
        InMemoryRelayRepository::with_relays(relays.iter().map(|r| r.descriptor.clone()));
    let circuits = Arc::new(InMemoryCircuitRepository::new());
    let client = VeilClient::new(
        CircuitConfig::default(),
        Arc::new(directory),
        circuits.clone(),
        Arc::new(hidden),
    );
    TestClient {
        client: Arc::new(client),
        circuits,
    }
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, future).await.expect("timed out")
}

async fn next_event(events: &mut mpsc::Receiver<StreamEvent>) -> StreamEvent {
    within(events.recv()).await.expect("event channel closed")
}

async fn read_until_eof(socket: &mut TcpStream) -> Vec<u8> {
    let mut received = Vec::new();
    within(socket.read_to_end(&mut received)).await.unwrap();
    received
}

async fn destination() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

#[tokio::test]
async fn test_stream_through_two_hops() {
    let relays = spawn_relays(2, Duration::from_secs(60)).await;
    let TestClient { client, .. } = client_for(&relays, InMemoryHiddenServiceRepository::new());
    let (listener, dest_addr) = destination().await;

    let cid = client.build_circuit(2, None).await.unwrap();
    let sid = client.open_stream(cid).unwrap();
    let mut events = client.subscribe(cid, sid).unwrap();
    client.send_begin(cid, sid, &dest_addr.to_string()).await.unwrap();

    let (mut dest, _) = within(listener.accept()).await.unwrap();
    assert!(matches!(next_event(&mut events).await, StreamEvent::Connected));

    client.send_data(cid, sid, b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    within(dest.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"hello");

    dest.write_all(b"world").await.unwrap();
    let mut reply = Vec::new();
    while reply.len() < 5 {
        match next_event(&mut events).await {
            StreamEvent::Data(data) => reply.extend_from_slice(&data),
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(reply, b"world");

    client.close_stream(cid, sid).await.unwrap();
    assert!(read_until_eof(&mut dest).await.is_empty());
    assert!(client.is_alive(&cid));
}

#[tokio::test]
async fn test_large_write_is_fragmented() {
    let relays = spawn_relays(3, Duration::from_secs(60)).await;
    let TestClient { client, .. } = client_for(&relays, InMemoryHiddenServiceRepository::new());
    let (listener, dest_addr) = destination().await;

    let cid = client.build_circuit(3, None).await.unwrap();
    let sid = client.open_stream(cid).unwrap();
    let mut events = client.subscribe(cid, sid).unwrap();
    client.send_begin(cid, sid, &dest_addr.to_string()).await.unwrap();
    let (mut dest, _) = within(listener.accept()).await.unwrap();
    assert!(matches!(next_event(&mut events).await, StreamEvent::Connected));

    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    client.send_data(cid, sid, &payload).await.unwrap();
    let mut received = vec![0u8; payload.len()];
    within(dest.read_exact(&mut received)).await.unwrap();
    assert_eq!(received, payload);
}

#[tokio::test]
async fn test_begin_to_closed_port_is_rejected() {
    let relays = spawn_relays(2, Duration::from_secs(60)).await;
    let TestClient { client, .. } = client_for(&relays, InMemoryHiddenServiceRepository::new());
    let (listener, dest_addr) = destination().await;
    drop(listener);

    let cid = client.build_circuit(2, None).await.unwrap();
    let sid = client.open_stream(cid).unwrap();
    let mut events = client.subscribe(cid, sid).unwrap();
    client.send_begin(cid, sid, &dest_addr.to_string()).await.unwrap();

    assert!(matches!(next_event(&mut events).await, StreamEvent::Rejected(_)));
    assert!(matches!(
        client.send_data(cid, sid, b"x").await,
        Err(VeilError::StreamNotFound(_))
    ));
}

#[tokio::test]
async fn test_overlong_target_leaves_circuit_usable() {
    let relays = spawn_relays(2, Duration::from_secs(60)).await;
    let TestClient { client, .. } = client_for(&relays, InMemoryHiddenServiceRepository::new());
    let (listener, dest_addr) = destination().await;

    let cid = client.build_circuit(2, None).await.unwrap();
    let long_target = format!("{}.example:80", "a".repeat(600));
    let sid = client.open_stream(cid).unwrap();
    assert!(matches!(
        client.send_begin(cid, sid, &long_target).await,
        Err(VeilError::InvalidPayload(_))
    ));
    assert!(matches!(
        client.connect(cid, &long_target).await,
        Err(VeilError::InvalidPayload(_))
    ));

    // The relays are still in step with the client's nonces
    let mut events = client.subscribe(cid, sid).unwrap();
    client.send_begin(cid, sid, &dest_addr.to_string()).await.unwrap();
    let (mut dest, _) = within(listener.accept()).await.unwrap();
    assert!(matches!(next_event(&mut events).await, StreamEvent::Connected));

    client.send_data(cid, sid, b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    within(dest.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"still here");
    assert!(client.is_alive(&cid));
}

#[tokio::test]
async fn test_cancelled_send_keeps_circuit_in_step() {
    let relays = spawn_relays(3, Duration::from_secs(60)).await;
    let TestClient { client, .. } = client_for(&relays, InMemoryHiddenServiceRepository::new());
    let (listener, dest_addr) = destination().await;

    let cid = client.build_circuit(3, None).await.unwrap();
    let sid = client.open_stream(cid).unwrap();
    let mut events = client.subscribe(cid, sid).unwrap();
    client.send_begin(cid, sid, &dest_addr.to_string()).await.unwrap();
    let (mut dest, _) = within(listener.accept()).await.unwrap();
    assert!(matches!(next_event(&mut events).await, StreamEvent::Connected));

    // Abandon a many-cell write part way through
    let bulk = vec![0x42u8; 64 * 1024];
    let _ = tokio::time::timeout(Duration::from_millis(2), client.send_data(cid, sid, &bulk)).await;
    client.send_data(cid, sid, b"tail").await.unwrap();

    // Whatever was sent of the bulk arrives whole, then the tail
    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    while !received.ends_with(b"tail") {
        let n = within(dest.read(&mut buf)).await.unwrap();
        assert!(n > 0, "destination closed early");
        received.extend_from_slice(&buf[..n]);
    }
    let sent = received.len() - 4;
    assert!(sent <= bulk.len());
    assert!(received[..sent].iter().all(|b| *b == 0x42));
    assert!(client.is_alive(&cid));
}

#[tokio::test]
async fn test_destroy_closes_every_stream() {
    let relays = spawn_relays(2, Duration::from_secs(60)).await;
    let TestClient { client, circuits } =
        client_for(&relays, InMemoryHiddenServiceRepository::new());
    let (listener, dest_addr) = destination().await;

    let cid = client.build_circuit(2, None).await.unwrap();
    let mut destinations = Vec::new();
    for _ in 0..2 {
        let sid = client.open_stream(cid).unwrap();
        let mut events = client.subscribe(cid, sid).unwrap();
        client.send_begin(cid, sid, &dest_addr.to_string()).await.unwrap();
        let (dest, _) = within(listener.accept()).await.unwrap();
        assert!(matches!(next_event(&mut events).await, StreamEvent::Connected));
        destinations.push(dest);
    }
    wait_until(|| relays.iter().all(|r| r.table.len() == 1)).await;

    client.destroy_circuit(cid).await.unwrap();
    assert!(!client.is_alive(&cid));
    assert!(circuits.is_empty());

    for dest in destinations.iter_mut() {
        assert!(read_until_eof(dest).await.is_empty());
    }
    wait_until(|| relays.iter().all(|r| r.table.is_empty())).await;

    assert!(matches!(
        client.destroy_circuit(cid).await,
        Err(VeilError::CircuitNotFound(_))
    ));
}

#[tokio::test]
async fn test_idle_circuits_are_evicted() {
    let relays = spawn_relays(1, Duration::from_millis(200)).await;
    let TestClient { client, circuits } =
        client_for(&relays, InMemoryHiddenServiceRepository::new());

    let cid = client.build_circuit(1, None).await.unwrap();
    assert!(relays[0].table.contains(&cid));

    wait_until(|| relays[0].table.find(&cid).is_none()).await;
    wait_until(|| !client.is_alive(&cid)).await;
    assert!(circuits.is_empty());
}

#[tokio::test]
async fn test_too_few_relays_builds_nothing() {
    let relays = spawn_relays(2, Duration::from_secs(60)).await;
    let TestClient { client, circuits } =
        client_for(&relays, InMemoryHiddenServiceRepository::new());

    let result = client.build_circuit(3, None).await;
    assert!(matches!(
        result,
        Err(VeilError::NotEnoughRelays {
            requested: 3,
            available: 2
        })
    ));
    assert!(circuits.is_empty());
    assert!(client.circuit_ids().is_empty());
    assert!(relays.iter().all(|r| r.table.is_empty()));
}

#[tokio::test]
async fn test_hidden_service_connect() {
    let (service, service_addr) = destination().await;
    let mut relays = spawn_relays(1, Duration::from_secs(60)).await;
    relays.push(spawn_relay("host", Duration::from_secs(60), Some(service_addr.to_string())).await);
    let host_id = relays[1].descriptor.id;

    let service_keys = RelayKeyPair::generate(1024).unwrap();
    let record = HiddenServiceRecord::new(service_keys.public_key_der().unwrap(), host_id);
    let address = record.address;
    let hidden = InMemoryHiddenServiceRepository::new();
    hidden.publish(record).unwrap();
    let TestClient { client, .. } = client_for(&relays, hidden);

    let exit = client.resolve_hidden(&address).unwrap();
    assert_eq!(exit, host_id);
    let cid = client.build_circuit(2, Some(exit)).await.unwrap();
    let mut events = client.connect(cid, "").await.unwrap();

    let (mut conn, _) = within(service.accept()).await.unwrap();
    assert!(matches!(next_event(&mut events).await, StreamEvent::Connected));

    client.send_data(cid, 0, b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    within(conn.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"ping");

    conn.write_all(b"pong").await.unwrap();
    match next_event(&mut events).await {
        StreamEvent::Data(data) => assert_eq!(&data[..], b"pong"),
        other => panic!("unexpected event {:?}", other),
    }

    client.destroy_circuit(cid).await.unwrap();
    assert!(read_until_eof(&mut conn).await.is_empty());
}

#[tokio::test]
async fn test_socks_connect_through_circuit() {
    let relays = spawn_relays(2, Duration::from_secs(60)).await;
    let TestClient { client, .. } = client_for(&relays, InMemoryHiddenServiceRepository::new());
    let (listener, dest_addr) = destination().await;

    let socks = SocksServer::bind("127.0.0.1:0".parse().unwrap(), client.clone(), 2)
        .await
        .unwrap();
    let socks_addr = socks.local_addr().unwrap();
    socks.spawn();

    let mut app = TcpStream::connect(socks_addr).await.unwrap();
    app.write_all(&[5, 1, 0]).await.unwrap();
    let mut choice = [0u8; 2];
    within(app.read_exact(&mut choice)).await.unwrap();
    assert_eq!(choice, [5, 0]);

    let mut request = vec![5, 1, 0, 1, 127, 0, 0, 1];
    request.extend_from_slice(&dest_addr.port().to_be_bytes());
    app.write_all(&request).await.unwrap();

    let (mut dest, _) = within(listener.accept()).await.unwrap();
    let mut reply = [0u8; 10];
    within(app.read_exact(&mut reply)).await.unwrap();
    assert_eq!(&reply[..2], &[5, 0]);

    app.write_all(b"GET /").await.unwrap();
    let mut buf = [0u8; 5];
    within(dest.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"GET /");

    dest.write_all(b"200 OK").await.unwrap();
    let mut response = [0u8; 6];
    within(app.read_exact(&mut response)).await.unwrap();
    assert_eq!(&response, b"200 OK");
    assert_eq!(client.circuit_ids().len(), 1);
}
