//! TCP transport and registry tests over real loopback sockets.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::timeout;

use lantern_core::identity::Identity;
use lantern_core::psk::{GateConfig, PreSharedKey};
use lantern_core::routing::RoutingService;
use lantern_core::transport::{TransportError, TransportHost};
use lantern_core::{AddrTtl, CHAT_PROTOCOL, NodeId, PeerAddr, echo_once, read_frame, write_frame};
use lantern_net::registry::{RegistryRouting, RegistryServer, registry_protocol};
use lantern_net::tcp::TcpTransportHost;

const WAIT: Duration = Duration::from_secs(5);
const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

async fn host(gate: GateConfig) -> (Arc<TcpTransportHost>, PeerAddr, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let identity = Identity::generate(dir.path().join("peer.key")).unwrap();
    let host = TcpTransportHost::bind(&identity, gate, 0).await.unwrap();
    let addr = host.addr_with_ip(LOCALHOST);
    (host, addr, dir)
}

#[tokio::test]
async fn handshake_then_echo_over_loopback() {
    let (alice, _alice_addr, _g1) = host(GateConfig::open()).await;
    let (bob, bob_addr, _g2) = host(GateConfig::open()).await;

    bob.register_handler(
        CHAT_PROTOCOL,
        Arc::new(|_, stream| {
            tokio::spawn(echo_once(stream));
        }),
    );

    alice.directory().insert(&bob_addr, AddrTtl::Permanent);
    // Reachability first, streams after, as the bootstrap connector does.
    alice.connect(&bob_addr).await.unwrap();

    let mut stream = alice.open_stream(&bob_addr.id, CHAT_PROTOCOL).await.unwrap();
    write_frame(&mut stream, "hello bob").await.unwrap();
    let mut reader = BufReader::new(stream);
    let reply = timeout(WAIT, read_frame(&mut reader)).await.unwrap().unwrap();
    assert_eq!(reply.as_deref(), Some("hello bob"));
    assert_eq!(read_frame(&mut reader).await.unwrap(), None);
}

#[tokio::test]
async fn psk_mismatch_fails_the_handshake() {
    let (alice, _, _g1) = host(GateConfig::with_psk(PreSharedKey::generate())).await;
    let (_bob, bob_addr, _g2) = host(GateConfig::with_psk(PreSharedKey::generate())).await;

    let err = alice.connect(&bob_addr).await.unwrap_err();
    assert!(matches!(err, TransportError::Handshake(_)), "got {err}");
}

#[tokio::test]
async fn unexpected_identity_fails_the_handshake() {
    let (alice, _, _g1) = host(GateConfig::open()).await;
    let (_bob, bob_addr, _g2) = host(GateConfig::open()).await;

    // Bob's socket, somebody else's id.
    let imposter = PeerAddr::new(NodeId::from_bytes([7u8; 32]), bob_addr.addrs.clone());
    let err = alice.connect(&imposter).await.unwrap_err();
    assert!(matches!(err, TransportError::Handshake(_)), "got {err}");
}

#[tokio::test]
async fn unknown_protocol_gets_no_stream() {
    let (alice, _, _g1) = host(GateConfig::open()).await;
    let (_bob, bob_addr, _g2) = host(GateConfig::open()).await;

    alice.directory().insert(&bob_addr, AddrTtl::Permanent);
    let mut stream = alice
        .open_stream(&bob_addr.id, "/nonexistent/1.0.0")
        .await
        .unwrap();
    // The acceptor drops the connection once it sees the unknown label.
    let mut buf = [0u8; 8];
    let n = timeout(WAIT, stream.read(&mut buf)).await.unwrap().unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn aborted_stream_is_not_a_clean_close() {
    let (alice, _, _g1) = host(GateConfig::open()).await;
    let (bob, bob_addr, _g2) = host(GateConfig::open()).await;

    let (tx, mut rx) = mpsc::channel(1);
    bob.register_handler(
        CHAT_PROTOCOL,
        Arc::new(move |_, mut stream| {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                let _ = tx.send(stream.read(&mut buf).await).await;
            });
        }),
    );

    alice.directory().insert(&bob_addr, AddrTtl::Permanent);
    let stream = alice.open_stream(&bob_addr.id, CHAT_PROTOCOL).await.unwrap();
    stream.abort();

    let read = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(read.is_err(), "peer saw a clean close: {read:?}");
}

#[tokio::test]
async fn registry_discovers_current_and_future_announcements() {
    let label = "meet-me-here";
    let protocol = registry_protocol("/lantern");

    let (registry_host, registry_addr, _g1) = host(GateConfig::open()).await;
    let server = RegistryServer::new();
    registry_host.register_handler(&protocol, server.handler());

    let (host_a, addr_a, _g2) = host(GateConfig::open()).await;
    let (host_b, addr_b, _g3) = host(GateConfig::open()).await;

    let routing_a = RegistryRouting::new(
        Arc::clone(&host_a) as Arc<dyn TransportHost>,
        vec![registry_addr.clone()],
        addr_a.clone(),
    );
    let routing_b = RegistryRouting::new(
        Arc::clone(&host_b) as Arc<dyn TransportHost>,
        vec![registry_addr.clone()],
        addr_b.clone(),
    );

    routing_a.bootstrap().await.unwrap();
    routing_b.bootstrap().await.unwrap();

    // A announces before B starts looking.
    routing_a.advertise(label).await.unwrap();
    let mut peers = routing_b.find_peers(label).await.unwrap();
    let found = timeout(WAIT, peers.recv()).await.unwrap().unwrap();
    assert_eq!(found.id, addr_a.id);
    assert_eq!(found.addrs, addr_a.addrs);

    // B announces after A's stream is already open.
    let mut peers_a = routing_a.find_peers(label).await.unwrap();
    let first = timeout(WAIT, peers_a.recv()).await.unwrap().unwrap();
    assert_eq!(first.id, addr_a.id);
    routing_b.advertise(label).await.unwrap();
    let second = timeout(WAIT, peers_a.recv()).await.unwrap().unwrap();
    assert_eq!(second.id, addr_b.id);
}

#[tokio::test]
async fn registry_bootstrap_needs_a_reachable_registry() {
    let (host_a, addr_a, _g1) = host(GateConfig::open()).await;
    // A registry address nobody is listening on.
    let ghost = PeerAddr::new(
        NodeId::from_bytes([9u8; 32]),
        vec!["127.0.0.1:1".parse().unwrap()],
    );
    let routing = RegistryRouting::new(
        Arc::clone(&host_a) as Arc<dyn TransportHost>,
        vec![ghost],
        addr_a,
    );
    let err = routing.bootstrap().await.unwrap_err();
    assert!(matches!(err, lantern_core::RoutingError::Bootstrap(_)));
}
