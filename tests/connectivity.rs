use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tokio_udt_lite::{
    ConnectionEvent, ListenerEvent, Udt, UdtConfiguration, UdtConnection, UdtListener, UdtStatus,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

async fn read_exact(connection: &mut UdtConnection, len: usize) -> Vec<u8> {
    let mut received = Vec::with_capacity(len);
    let mut buf = [0u8; 2048];
    while received.len() < len {
        let nbytes = connection.recv(&mut buf).await.unwrap();
        assert!(nbytes > 0, "connection closed after {} bytes", received.len());
        received.extend_from_slice(&buf[..nbytes]);
    }
    received
}

async fn connected_pair(udt: &Udt) -> (UdtListener, UdtConnection, UdtConnection) {
    let mut listener = UdtListener::bind(udt, loopback()).unwrap();
    let server_addr = listener.local_addr();
    let client = UdtConnection::connect_to(udt, loopback(), server_addr);
    let (client, accepted) = tokio::join!(client, listener.accept());
    let (peer, server) = accepted.unwrap();
    let client = client.unwrap();
    assert_eq!(Some(peer), client.local_addr());
    (listener, client, server)
}

#[tokio::test]
async fn transfer_survives_fragmentation() {
    init_tracing();
    let udt = Udt::new();
    let (_listener, client, mut server) = connected_pair(&udt).await;
    assert_eq!(client.status(), UdtStatus::Connected);
    assert_eq!(server.status(), UdtStatus::Connected);

    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    client.send(&payload).unwrap();
    let received = timeout(TEST_TIMEOUT, read_exact(&mut server, payload.len()))
        .await
        .unwrap();
    assert_eq!(received, payload);
}

#[tokio::test]
async fn messages_keep_their_order() {
    init_tracing();
    let udt = Udt::new();
    let (_listener, client, mut server) = connected_pair(&udt).await;

    let mut expected = vec![];
    for i in 0..200u32 {
        let msg = vec![(i % 256) as u8; 1 + (i as usize * 37) % 3000];
        client.send(&msg).unwrap();
        expected.extend(msg);
    }
    let received = timeout(TEST_TIMEOUT, read_exact(&mut server, expected.len()))
        .await
        .unwrap();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn loopback_handshake_needs_no_retry() {
    init_tracing();
    let udt = Udt::new();
    let mut listener = UdtListener::bind(&udt, loopback()).unwrap();
    let server_addr = listener.local_addr();
    let started = Instant::now();
    let client = UdtConnection::connect_to(&udt, loopback(), server_addr);
    let (client, accepted) = tokio::join!(client, listener.accept());
    client.unwrap();
    accepted.unwrap();
    // well under one 250ms handshake retry
    assert!(started.elapsed() < Duration::from_millis(200), "{:?}", started.elapsed());
}

#[tokio::test]
async fn shared_endpoint_keeps_larger_packets_whole() {
    init_tracing();
    let udt = Udt::new();
    let mut small = UdtConfiguration::default();
    small.mss = 600;
    let first = UdtConnection::open_with(&udt, loopback(), small).unwrap();
    let local = first.local_addr().unwrap();

    let mut listener = UdtListener::bind(&udt, loopback()).unwrap();
    let server_addr = listener.local_addr();
    let client = UdtConnection::connect_to(&udt, local, server_addr);
    let (client, accepted) = tokio::join!(client, listener.accept());
    let mut client = client.unwrap();
    let (_, server) = accepted.unwrap();
    assert_eq!(client.local_addr(), Some(local));

    let payload: Vec<u8> = (0..1400u32).map(|i| (i % 199) as u8).collect();
    server.send(&payload).unwrap();
    let received = timeout(TEST_TIMEOUT, read_exact(&mut client, payload.len()))
        .await
        .unwrap();
    assert_eq!(received, payload);
    drop(first);
}

#[tokio::test]
async fn both_directions() {
    init_tracing();
    let udt = Udt::new();
    let (_listener, mut client, mut server) = connected_pair(&udt).await;

    server.send(b"ping from server").unwrap();
    client.send(b"ping from client").unwrap();
    let at_client = timeout(TEST_TIMEOUT, read_exact(&mut client, 16)).await.unwrap();
    let at_server = timeout(TEST_TIMEOUT, read_exact(&mut server, 16)).await.unwrap();
    assert_eq!(at_client, b"ping from server");
    assert_eq!(at_server, b"ping from client");
}

#[tokio::test]
async fn timeout_below_floor_is_refused() {
    let udt = Udt::new();
    let connection = UdtConnection::open(&udt, loopback()).unwrap();
    let err = connection
        .set_timeout(Duration::from_millis(249))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    connection.set_timeout(Duration::from_millis(250)).unwrap();
    assert_eq!(connection.status(), UdtStatus::Initial);

    let mut config = UdtConfiguration::default();
    config.connect_timeout = Duration::from_millis(100);
    let err = UdtConnection::open_with(&udt, loopback(), config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test]
async fn silent_peer_times_out() {
    init_tracing();
    let udt = Udt::new();
    let silent = tokio::net::UdpSocket::bind(loopback()).await.unwrap();

    let mut connection = UdtConnection::open(&udt, loopback()).unwrap();
    connection.set_timeout(Duration::from_millis(300)).unwrap();
    let started = Instant::now();
    let err = connection
        .connect(silent.local_addr().unwrap())
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.kind(), ErrorKind::TimedOut);
    assert!(elapsed >= Duration::from_millis(300), "{:?}", elapsed);
    // one retry interval, plus scheduling slack
    assert!(elapsed < Duration::from_millis(300 + 250 + 200), "{:?}", elapsed);
    assert_eq!(connection.status(), UdtStatus::Closed);
}

#[tokio::test]
async fn shutdown_reaches_peer() {
    init_tracing();
    let udt = Udt::new();
    let (_listener, client, mut server) = connected_pair(&udt).await;

    client.shutdown();
    assert_eq!(client.status(), UdtStatus::Closed);
    let event = timeout(TEST_TIMEOUT, server.next_event()).await.unwrap();
    assert!(matches!(event, Some(ConnectionEvent::Closed)), "{:?}", event);
    let mut buf = [0u8; 16];
    assert_eq!(server.recv(&mut buf).await.unwrap(), 0);
    assert!(client.send(b"late").is_err());
}

#[tokio::test]
async fn listener_reports_lifecycle() {
    init_tracing();
    let udt = Udt::new();
    let mut listener = UdtListener::bind(&udt, loopback()).unwrap();
    let server_addr = listener.local_addr();
    match listener.next_event().await {
        Some(ListenerEvent::Listening(addr)) => assert_eq!(addr, server_addr),
        other => panic!("unexpected {:?}", other),
    }

    let client = UdtConnection::connect_to(&udt, loopback(), server_addr);
    let (client, event) = tokio::join!(client, listener.next_event());
    let client = client.unwrap();
    let server = match event {
        Some(ListenerEvent::Connection(peer, server)) => {
            assert_eq!(Some(peer), client.local_addr());
            server
        }
        other => panic!("unexpected {:?}", other),
    };

    listener.close();
    // still one accepted connection alive
    assert!(timeout(Duration::from_millis(100), listener.next_event())
        .await
        .is_err());
    drop(server);
    let event = timeout(TEST_TIMEOUT, listener.next_event()).await.unwrap();
    assert!(matches!(event, Some(ListenerEvent::Close)), "{:?}", event);
    assert!(listener.next_event().await.is_none());
    assert!(listener.accept().await.is_err());
}

#[tokio::test]
async fn connections_share_the_endpoint() {
    let udt = Udt::new();
    let first = UdtConnection::open(&udt, loopback()).unwrap();
    let local = first.local_addr().unwrap();
    let second = UdtConnection::open(&udt, local).unwrap();
    assert_eq!(second.local_addr(), Some(local));
    assert_ne!(first.socket_id(), second.socket_id());
    assert_eq!(udt.endpoint_count(), 1);

    drop(first);
    assert_eq!(udt.endpoint_count(), 1);
    drop(second);
    assert_eq!(udt.endpoint_count(), 0);
}

#[tokio::test]
async fn wildcard_port_cannot_be_narrowed() {
    let udt = Udt::new();
    let listener = UdtListener::bind(&udt, "0.0.0.0:0".parse().unwrap()).unwrap();
    let port = listener.local_addr().port();
    let err = UdtConnection::open(&udt, SocketAddr::from(([127, 0, 0, 1], port))).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AddrInUse);
    let err = UdtListener::bind(&udt, listener.local_addr()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AddrInUse);
}

#[tokio::test]
async fn ipv6_is_unsupported() {
    let udt = Udt::new();
    let err = UdtConnection::open(&udt, "[::1]:0".parse().unwrap()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
}
