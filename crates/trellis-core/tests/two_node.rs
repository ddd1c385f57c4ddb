//! Two-node integration: connection establishment, self-connect rejection,
//! crossed-connect convergence, and virtual-vs-real arbitration over real
//! loopback TCP.

use std::sync::Arc;
use std::time::Duration;
use trellis_core::node::{
    handshake, ConnectivityConfig, MeshNode, NodeConfig, NodeError, TunnelDialer,
};
use trellis_transport::{exchange_decoy, DecoyRole, Endpoint, PeerStream};

fn quiet_config() -> NodeConfig {
    NodeConfig {
        local_port: 0,
        enable_upnp: false,
        enable_local_discovery: false,
        connectivity: ConnectivityConfig { enabled: false, ..Default::default() },
        ..NodeConfig::default()
    }
}

async fn started_node() -> MeshNode {
    let node = MeshNode::new(quiet_config());
    node.start().await.unwrap();
    node
}

fn loopback_endpoint(node: &MeshNode) -> Endpoint {
    Endpoint::new("127.0.0.1".parse().unwrap(), node.service_port())
}

#[tokio::test]
async fn connect_and_deduplicate() {
    let a = started_node().await;
    let b = started_node().await;
    let b_ep = loopback_endpoint(&b);

    let conn = a.make_connection(&b_ep).await.unwrap();
    assert_eq!(conn.peer_id(), b.peer_id());
    assert!(!conn.is_virtual());
    assert_eq!(a.registry().len(), 1);

    // Second call returns the same record without a second dial.
    let again = a.make_connection(&b_ep).await.unwrap();
    assert!(Arc::ptr_eq(&conn, &again));
    assert_eq!(a.registry().len(), 1);

    // The accept side registered us under our advertised service port.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let b_view = b.registry().get_by_peer(&a.peer_id()).unwrap();
    assert_eq!(b_view.remote_endpoint().port(), a.service_port());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn self_connect_is_rejected() {
    let a = started_node().await;
    let self_ep = loopback_endpoint(&a);

    let err = a.make_connection(&self_ep).await.unwrap_err();
    assert!(matches!(err, NodeError::SelfConnection));
    assert!(a.registry().is_empty());

    a.shutdown().await;
}

#[tokio::test]
async fn crossed_connect_converges_to_one_record_per_side() {
    let a = started_node().await;
    let b = started_node().await;
    let a_ep = loopback_endpoint(&a);
    let b_ep = loopback_endpoint(&b);

    let dial_ab = {
        let a = a.clone();
        tokio::spawn(async move { a.make_connection(&b_ep).await })
    };
    let dial_ba = {
        let b = b.clone();
        tokio::spawn(async move { b.make_connection(&a_ep).await })
    };

    let from_a = dial_ab.await.unwrap().unwrap();
    let from_b = dial_ba.await.unwrap().unwrap();

    assert_eq!(from_a.peer_id(), b.peer_id());
    assert_eq!(from_b.peer_id(), a.peer_id());

    // Let the loser's cancel path and any displaced teardown settle.
    tokio::time::sleep(Duration::from_millis(700)).await;

    assert_eq!(a.registry().len(), 1, "node A must hold exactly one record");
    assert_eq!(b.registry().len(), 1, "node B must hold exactly one record");

    let a_record = a.registry().get_by_peer(&b.peer_id()).unwrap();
    let b_record = b.registry().get_by_peer(&a.peer_id()).unwrap();
    assert!(!a_record.is_disposed());
    assert!(!b_record.is_disposed());

    a.shutdown().await;
    b.shutdown().await;
}

/// Tunnel dialer that "relays" by opening a plain TCP connection and
/// running the client decoy, which is exactly what a relayed stream looks
/// like to the handshake layer.
struct LoopbackTunnel;

#[async_trait::async_trait]
impl TunnelDialer for LoopbackTunnel {
    async fn open_tunnel(
        &self,
        _relay: &Arc<trellis_core::node::Connection>,
        target: &Endpoint,
    ) -> trellis_core::node::Result<Box<dyn PeerStream>> {
        let stream =
            trellis_transport::connect_direct(target, Duration::from_secs(2)).await?;
        let mut stream: Box<dyn PeerStream> = Box::new(stream);
        let host = format!("{}:{}", target.host_string(), target.port());
        exchange_decoy(&mut stream, DecoyRole::Client, &host).await?;
        Ok(stream)
    }
}

#[tokio::test]
async fn virtual_connection_displaced_by_real() {
    let a = started_node().await;
    let b = started_node().await;
    let b_ep = loopback_endpoint(&b);

    a.set_tunnel_dialer(Arc::new(LoopbackTunnel));

    // Relay stand-in record; only its identity matters to the dialer.
    let relay = trellis_core::node::Connection::new(
        trellis_transport::PeerId::random(),
        Endpoint::new("203.0.113.99".parse().unwrap(), 41700),
        false,
        None,
    );

    let tunnel = a.make_virtual_connection(&b_ep, &relay).await.unwrap();
    assert!(tunnel.is_virtual());
    assert_eq!(tunnel.peer_id(), b.peer_id());
    assert_eq!(a.registry().len(), 1);

    // A direct path opens: B dials A. On A, the real inbound connection
    // must displace the virtual record and close its tunnel stream.
    let stream = trellis_transport::connect_direct(
        &loopback_endpoint(&a),
        Duration::from_secs(2),
    )
    .await
    .unwrap();
    let mut stream: Box<dyn PeerStream> = Box::new(stream);
    exchange_decoy(&mut stream, DecoyRole::Client, "peer").await.unwrap();
    let ctx = handshake::HandshakeContext {
        registry: Arc::clone(b.registry()),
        local_peer: b.peer_id(),
        local_port: b.service_port(),
    };
    let direct = handshake::initiate(stream, loopback_endpoint(&a), &ctx, false).await;
    assert!(direct.is_ok());

    tokio::time::sleep(Duration::from_millis(200)).await;

    let surviving = a.registry().get_by_peer(&b.peer_id()).unwrap();
    assert!(!surviving.is_virtual(), "real record must replace the tunnel");
    assert!(tunnel.is_disposed(), "displaced tunnel stream must be closed");
    assert_eq!(a.registry().len(), 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn tunnel_closes_with_its_relay_connection() {
    let a = started_node().await;
    let b = started_node().await;
    let b_ep = loopback_endpoint(&b);

    a.set_tunnel_dialer(Arc::new(LoopbackTunnel));
    let relay = trellis_core::node::Connection::new(
        trellis_transport::PeerId::random(),
        Endpoint::new("203.0.113.99".parse().unwrap(), 41700),
        false,
        None,
    );

    let tunnel = a.make_virtual_connection(&b_ep, &relay).await.unwrap();
    assert!(tunnel.is_virtual());
    assert_eq!(a.registry().len(), 1);

    a.dispose_connection(&relay);

    assert!(tunnel.is_disposed(), "tunnel must close with its relay");
    assert!(a.registry().is_empty());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn concurrent_connects_to_same_endpoint_coalesce() {
    let a = started_node().await;
    let b = started_node().await;
    let b_ep = loopback_endpoint(&b);

    let mut dials = Vec::new();
    for _ in 0..8 {
        let a = a.clone();
        let ep = b_ep.clone();
        dials.push(tokio::spawn(async move { a.make_connection(&ep).await }));
    }

    let mut ok = 0;
    for dial in dials {
        match dial.await.unwrap() {
            Ok(conn) => {
                assert_eq!(conn.peer_id(), b.peer_id());
                ok += 1;
            }
            Err(NodeError::ConnectInProgress) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(ok >= 1, "at least the winning dial must succeed");
    assert_eq!(a.registry().len(), 1);

    a.shutdown().await;
    b.shutdown().await;
}
