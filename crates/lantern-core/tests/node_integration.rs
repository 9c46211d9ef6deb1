//! End-to-end orchestrator tests over the in-memory transport and registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use lantern_core::mem::{MemoryNetwork, MemoryRegistry, MemoryRouting};
use lantern_core::{
    AddrTtl, CHAT_PROTOCOL, CoordinatorState, GateConfig, Node, NodeConfig, NodeError, NodeId,
    PeerAddr, PeerStream, RoutingError, RoutingService, StreamHandler, TransportHost, connect_all,
    echo_once, read_frame, run_chat, write_frame,
};

const WAIT: Duration = Duration::from_secs(5);

fn id(byte: u8) -> NodeId {
    NodeId::from_bytes([byte; 32])
}

fn addr(byte: u8) -> PeerAddr {
    PeerAddr::new(id(byte), vec![])
}

fn mem_config() -> NodeConfig {
    NodeConfig {
        bootstrap: Vec::new(),
        ..NodeConfig::default()
    }
}

/// Handler plus a channel yielding every stream it receives.
fn collecting_handler() -> (StreamHandler, mpsc::Receiver<(NodeId, Box<dyn PeerStream>)>) {
    let (tx, rx) = mpsc::channel(8);
    let handler: StreamHandler = Arc::new(move |peer, stream| {
        let _ = tx.try_send((peer, stream));
    });
    (handler, rx)
}

#[tokio::test]
async fn bootstrap_reports_every_seed_after_partial_failure() {
    let net = MemoryNetwork::new();
    let gate = GateConfig::open();
    let local = net.host(id(1), &gate);
    let _up = net.host(id(2), &gate);
    // id(3) is never attached, so its dial fails.

    let seeds = [addr(2), addr(3)];
    let report = connect_all(local.clone(), &seeds, Duration::from_secs(1)).await;

    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.succeeded(), 1);
    assert_eq!(report.failed(), 1);
    assert!(!report.all_failed());

    // Both seeds keep permanent directory entries regardless of outcome.
    assert_eq!(local.directory().ttl_of(&id(2)), Some(AddrTtl::Permanent));
    assert_eq!(local.directory().ttl_of(&id(3)), Some(AddrTtl::Permanent));
}

#[tokio::test]
async fn echo_exchange_round_trips_one_frame() {
    let net = MemoryNetwork::new();
    let gate = GateConfig::open();
    let client = net.host(id(1), &gate);
    let seed = net.host(id(2), &gate);

    seed.register_handler(
        CHAT_PROTOCOL,
        Arc::new(|_, stream| {
            tokio::spawn(echo_once(stream));
        }),
    );

    client.directory().insert(&addr(2), AddrTtl::Permanent);
    let mut stream = client.open_stream(&id(2), CHAT_PROTOCOL).await.unwrap();

    write_frame(&mut stream, "ping over the wire").await.unwrap();
    let mut reader = BufReader::new(stream);
    let echoed = timeout(WAIT, read_frame(&mut reader)).await.unwrap().unwrap();
    assert_eq!(echoed.as_deref(), Some("ping over the wire"));
    // Clean close after the single exchange.
    assert_eq!(read_frame(&mut reader).await.unwrap(), None);
}

#[tokio::test]
async fn sessions_fail_independently() {
    let net = MemoryNetwork::new();
    let gate = GateConfig::open();
    let local = net.host(id(1), &gate);
    let remote = net.host(id(2), &gate);

    let (handler, mut inbound) = collecting_handler();
    remote.register_handler(CHAT_PROTOCOL, handler);
    local.directory().insert(&addr(2), AddrTtl::Ephemeral);

    let healthy = local.open_stream(&id(2), CHAT_PROTOCOL).await.unwrap();
    let doomed = local.open_stream(&id(2), CHAT_PROTOCOL).await.unwrap();
    let (_, remote_healthy) = inbound.recv().await.unwrap();
    let (_, mut remote_doomed) = inbound.recv().await.unwrap();

    doomed.abort();
    let mut buf = [0u8; 8];
    let err = timeout(WAIT, remote_doomed.read(&mut buf)).await.unwrap().unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);

    // The other session still carries frames both ways.
    let (a_out_tx, a_out) = mpsc::channel(4);
    let (a_in_tx, mut a_in) = mpsc::channel(4);
    let a_task = tokio::spawn(run_chat(id(2), healthy, a_out, a_in_tx));

    let (b_out_tx, b_out) = mpsc::channel(4);
    let (b_in_tx, mut b_in) = mpsc::channel(4);
    let b_task = tokio::spawn(run_chat(id(1), remote_healthy, b_out, b_in_tx));

    a_out_tx.send("still here?".to_string()).await.unwrap();
    assert_eq!(b_in.recv().await.unwrap(), "still here?");
    b_out_tx.send("still here".to_string()).await.unwrap();
    assert_eq!(a_in.recv().await.unwrap(), "still here");

    drop(a_out_tx);
    drop(b_out_tx);
    timeout(WAIT, a_task).await.unwrap().unwrap().unwrap();
    timeout(WAIT, b_task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn two_nodes_discover_each_other_and_chat() {
    let net = MemoryNetwork::new();
    let registry = MemoryRegistry::new();
    let gate = GateConfig::open();

    let host_a = net.host(id(1), &gate);
    let host_b = net.host(id(2), &gate);

    let (handler_a, _inbound_a) = collecting_handler();
    let (handler_b, mut inbound_b) = collecting_handler();
    host_a.register_handler(CHAT_PROTOCOL, Arc::clone(&handler_a));
    host_b.register_handler(CHAT_PROTOCOL, Arc::clone(&handler_b));

    let (session_a, mut sessions_a) = collecting_handler();
    let node_a = Arc::new(
        Node::new(
            Arc::clone(&host_a) as Arc<dyn TransportHost>,
            Arc::new(registry.routing_for(addr(1))),
            &mem_config(),
            session_a,
        )
        .unwrap(),
    );

    // Node B only advertises; A's coordinator is the one opening the stream.
    let routing_b = registry.routing_for(addr(2));
    routing_b
        .advertise(&mem_config().rendezvous_label)
        .await
        .unwrap();

    let mut state = node_a.state();
    let runner = {
        let node = Arc::clone(&node_a);
        tokio::spawn(async move { node.run().await })
    };

    // A discovers B and opens a chat stream to it.
    let (peer, outbound_stream) = timeout(WAIT, sessions_a.recv()).await.unwrap().unwrap();
    assert_eq!(peer, id(2));
    let (_, inbound_stream) = timeout(WAIT, inbound_b.recv()).await.unwrap().unwrap();

    timeout(WAIT, state.wait_for(|s| *s == CoordinatorState::SteadyState))
        .await
        .unwrap()
        .unwrap();

    let (a_out_tx, a_out) = mpsc::channel(4);
    let (a_in_tx, _a_in) = mpsc::channel(4);
    tokio::spawn(run_chat(id(2), outbound_stream, a_out, a_in_tx));

    let (_b_out_tx, b_out) = mpsc::channel(4);
    let (b_in_tx, mut b_in) = mpsc::channel(4);
    tokio::spawn(run_chat(id(1), inbound_stream, b_out, b_in_tx));

    a_out_tx.send("lanterns lit".to_string()).await.unwrap();
    assert_eq!(timeout(WAIT, b_in.recv()).await.unwrap().unwrap(), "lanterns lit");

    node_a.shutdown();
    timeout(WAIT, runner).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn own_announcement_is_ignored() {
    let net = MemoryNetwork::new();
    let registry = MemoryRegistry::new();
    let host = net.host(id(1), &GateConfig::open());

    let (session, mut sessions) = collecting_handler();
    let node = Arc::new(
        Node::new(
            host as Arc<dyn TransportHost>,
            Arc::new(registry.routing_for(addr(1))),
            &mem_config(),
            session,
        )
        .unwrap(),
    );

    let mut state = node.state();
    let runner = {
        let node = Arc::clone(&node);
        tokio::spawn(async move { node.run().await })
    };

    timeout(WAIT, state.wait_for(|s| *s == CoordinatorState::Discovering))
        .await
        .unwrap()
        .unwrap();
    // The only announcement under the label is our own. Give the coordinator
    // time to (wrongly) act on it.
    sleep(Duration::from_millis(100)).await;
    assert!(sessions.try_recv().is_err());
    assert_ne!(*state.borrow(), CoordinatorState::SteadyState);

    node.shutdown();
    timeout(WAIT, runner).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn routing_bootstrap_failure_is_fatal() {
    let net = MemoryNetwork::new();
    let registry = MemoryRegistry::new();
    let host = net.host(id(1), &GateConfig::open());

    let (session, _sessions) = collecting_handler();
    let node = Node::new(
        host as Arc<dyn TransportHost>,
        Arc::new(MemoryRouting::failing(&registry, addr(1))),
        &mem_config(),
        session,
    )
    .unwrap();

    let err = timeout(WAIT, node.run()).await.unwrap().unwrap_err();
    assert!(matches!(err, NodeError::Routing(RoutingError::Bootstrap(_))));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn losing_the_discovery_stream_is_fatal() {
    let net = MemoryNetwork::new();
    let registry = MemoryRegistry::new();
    let host = net.host(id(1), &GateConfig::open());

    let (session, _sessions) = collecting_handler();
    let node = Arc::new(
        Node::new(
            host as Arc<dyn TransportHost>,
            Arc::new(registry.routing_for(addr(1))),
            &mem_config(),
            session,
        )
        .unwrap(),
    );

    let mut state = node.state();
    let runner = {
        let node = Arc::clone(&node);
        tokio::spawn(async move { node.run().await })
    };
    timeout(WAIT, state.wait_for(|s| *s == CoordinatorState::Discovering))
        .await
        .unwrap()
        .unwrap();

    registry.close();
    let err = timeout(WAIT, runner).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, NodeError::Routing(RoutingError::DiscoveryStream)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn private_gates_keep_strangers_out() {
    let net = MemoryNetwork::new();
    let secret = lantern_core::PreSharedKey::generate();
    let member = net.host(id(1), &GateConfig::with_psk(secret));
    let _stranger = net.host(id(2), &GateConfig::open());

    member.directory().insert(&addr(2), AddrTtl::Ephemeral);
    let err = member
        .open_stream(&id(2), CHAT_PROTOCOL)
        .await
        .err()
        .expect("open_stream should fail");
    assert!(matches!(err, lantern_core::TransportError::Handshake(_)));
}
