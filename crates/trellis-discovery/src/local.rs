//! Local-segment DHT manager.
//!
//! One instance per live non-loopback interface address. Owns the beacon
//! socket on UDP 41988, a TCP listener for the segment's DHT channels, and
//! the segment's DHT node. Accepted TCP sockets are handed to the node's
//! connection-initiate pipeline over a channel; local streams skip the HTTP
//! decoy because the segment is private.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use trellis_transport::{
    connect_direct, AddressFamily, Endpoint, PeerStream, TransportKind, LAN_CONNECT_TIMEOUT,
};

use crate::beacon::{Beacon, DISCOVERY_PORT, IPV6_MULTICAST_GROUP};
use crate::dht::{DhtConnector, DhtNode};
use crate::error::Result;

/// Beacon retransmissions per announce burst.
const ANNOUNCE_BURST: u32 = 3;
/// Spacing between beacons inside a burst.
const ANNOUNCE_SPACING: Duration = Duration::from_secs(2);
/// Back-off between bursts while the segment is unpopulated.
const ANNOUNCE_REARM: Duration = Duration::from_secs(60);
/// Segment population at which beaconing backs off.
const POPULATED_NODE_COUNT: usize = 2;

/// Cached snapshot of one interface address.
///
/// Two records are equal iff the local IP is equal; that identity drives the
/// network watcher's add/remove decisions.
#[derive(Debug, Clone, Eq)]
pub struct NetworkInterfaceRecord {
    /// Interface-local IP address
    pub local_ip: IpAddr,
    /// IPv4 directed broadcast address, when derivable
    pub broadcast_ip: Option<Ipv4Addr>,
    /// OS interface index
    pub index: u32,
    /// Whether the interface is multicast-capable
    pub multicast: bool,
    /// Whether the interface is up
    pub up: bool,
}

impl PartialEq for NetworkInterfaceRecord {
    fn eq(&self, other: &Self) -> bool {
        self.local_ip == other.local_ip
    }
}

impl NetworkInterfaceRecord {
    /// The record's address family.
    #[must_use]
    pub fn family(&self) -> AddressFamily {
        match self.local_ip {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }
}

/// An accepted local-segment TCP stream, tagged with the segment's DHT node
/// so the version-0 shunt can route to it.
pub struct LocalInbound {
    /// The accepted socket
    pub stream: TcpStream,
    /// Remote socket address
    pub remote: SocketAddr,
    /// The segment's DHT node
    pub dht: DhtNode,
}

/// Plain-TCP DHT connector for private segments: no proxy, no decoy. The
/// accepted side still demuxes on a version byte, so the channel opens with
/// the shunt.
pub struct PlainTcpConnector;

#[async_trait::async_trait]
impl DhtConnector for PlainTcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn PeerStream>> {
        use tokio::io::AsyncWriteExt;

        let mut stream = connect_direct(endpoint, LAN_CONNECT_TIMEOUT).await?;
        stream.write_all(&[crate::dht::DHT_CHANNEL_SHUNT]).await?;
        stream.flush().await?;
        Ok(Box::new(stream))
    }
}

/// Per-interface discovery unit: beacon socket + TCP listener + DHT node.
pub struct LocalNetworkDhtManager {
    iface: NetworkInterfaceRecord,
    dht: DhtNode,
    tasks: Vec<JoinHandle<()>>,
}

impl LocalNetworkDhtManager {
    /// Bring up discovery on one interface address.
    ///
    /// Binds the beacon socket to `local_ip:41988` with address reuse and
    /// broadcast enabled (IPv6 joins `FF12::1` on the interface when it is
    /// up and multicast-capable), binds a TCP listener on an OS-assigned
    /// port, and starts the receive, accept, and announce loops.
    ///
    /// # Errors
    ///
    /// Fails when either socket cannot be bound.
    pub async fn new(
        iface: NetworkInterfaceRecord,
        inbound_tx: mpsc::Sender<LocalInbound>,
    ) -> Result<Self> {
        let udp = Arc::new(bind_beacon_socket(&iface)?);

        let listener = TcpListener::bind(SocketAddr::new(iface.local_ip, 0)).await?;
        let dht_endpoint = Endpoint::from_socket_addr(listener.local_addr()?);
        let dht = DhtNode::new(
            TransportKind::LocalNetwork,
            dht_endpoint,
            Arc::new(PlainTcpConnector),
        );

        tracing::info!(
            interface = %iface.local_ip,
            dht = %dht.bind_endpoint(),
            "local discovery started"
        );

        let mut tasks = Vec::with_capacity(3);
        tasks.push(tokio::spawn(receive_loop(Arc::clone(&udp), dht.clone())));
        tasks.push(tokio::spawn(accept_loop(listener, dht.clone(), inbound_tx)));
        tasks.push(tokio::spawn(announce_loop(udp, iface.clone(), dht.clone())));

        Ok(Self { iface, dht, tasks })
    }

    /// The interface record this manager serves.
    #[must_use]
    pub fn interface(&self) -> &NetworkInterfaceRecord {
        &self.iface
    }

    /// The interface-local IP this manager is keyed by.
    #[must_use]
    pub fn local_ip(&self) -> IpAddr {
        self.iface.local_ip
    }

    /// The segment's DHT node.
    #[must_use]
    pub fn dht(&self) -> &DhtNode {
        &self.dht
    }

    /// Stop every loop. Closing the owning sockets is the cancellation
    /// signal; aborting the tasks drops them.
    pub fn dispose(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        tracing::debug!(interface = %self.iface.local_ip, "local discovery disposed");
    }
}

impl Drop for LocalNetworkDhtManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn bind_beacon_socket(iface: &NetworkInterfaceRecord) -> Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = match iface.local_ip {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    match iface.local_ip {
        IpAddr::V4(_) => {
            socket.set_broadcast(true)?;
        }
        IpAddr::V6(_) => {
            if iface.up && iface.multicast {
                socket.join_multicast_v6(&IPV6_MULTICAST_GROUP, iface.index)?;
                socket.set_multicast_if_v6(iface.index)?;
            }
        }
    }

    let bind_addr = SocketAddr::new(iface.local_ip, DISCOVERY_PORT);
    socket.bind(&bind_addr.into())?;

    Ok(UdpSocket::from_std(socket.into())?)
}

/// Beacon receive loop: every parsed beacon whose derived endpoint differs
/// from our own DHT endpoint lands in the routing table. Errors never end
/// the loop.
async fn receive_loop(udp: Arc<UdpSocket>, dht: DhtNode) {
    let mut buf = [0u8; 64];
    loop {
        let (len, from) = match udp.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                tracing::debug!("beacon receive error: {err}");
                continue;
            }
        };
        match Beacon::decode(&buf[..len]) {
            Ok(beacon) => {
                let derived = Endpoint::new(from.ip(), beacon.dht_port);
                if derived != dht.bind_endpoint() {
                    tracing::trace!(peer = %derived, "beacon received");
                    dht.add_node(derived);
                }
            }
            Err(err) => {
                tracing::debug!(from = %from, "ignoring beacon: {err}");
            }
        }
    }
}

/// TCP accept loop: accepted sockets go straight to the connection-initiate
/// pipeline, tagged with this segment's DHT node.
async fn accept_loop(listener: TcpListener, dht: DhtNode, inbound_tx: mpsc::Sender<LocalInbound>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let inbound = LocalInbound { stream, remote, dht: dht.clone() };
                if inbound_tx.send(inbound).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                tracing::debug!("local accept error: {err}");
            }
        }
    }
}

/// Announce loop: bursts of up to three beacons at two-second spacing,
/// re-armed every sixty seconds only while the segment knows fewer than two
/// other nodes.
async fn announce_loop(udp: Arc<UdpSocket>, iface: NetworkInterfaceRecord, dht: DhtNode) {
    let target: SocketAddr = match iface.local_ip {
        IpAddr::V4(_) => {
            let broadcast = iface.broadcast_ip.unwrap_or(Ipv4Addr::BROADCAST);
            SocketAddr::new(IpAddr::V4(broadcast), DISCOVERY_PORT)
        }
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(IPV6_MULTICAST_GROUP), DISCOVERY_PORT),
    };
    let packet = Beacon::new(dht.bind_endpoint().port()).encode();

    loop {
        for _ in 0..ANNOUNCE_BURST {
            if dht.node_count() >= POPULATED_NODE_COUNT {
                break;
            }
            if let Err(err) = udp.send_to(&packet, target).await {
                tracing::debug!(target = %target, "beacon send failed: {err}");
            }
            tokio::time::sleep(ANNOUNCE_SPACING).await;
        }
        loop {
            tokio::time::sleep(ANNOUNCE_REARM).await;
            if dht.node_count() < POPULATED_NODE_COUNT {
                break;
            }
        }
    }
}
