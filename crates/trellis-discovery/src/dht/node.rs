//! Per-transport DHT node handle.
//!
//! One handle exists per (node, transport) pair. It owns a Kademlia-style
//! routing table keyed by XOR distance, a TTL'd announcement store, and the
//! TCP-channel query logic; the full bucket-maintenance algorithm is assumed
//! external and the table here keeps a bounded, closest-first view.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use trellis_transport::{Endpoint, NetworkId, PeerStream, TransportKind};

use super::protocol::{read_message, write_message, DhtMessage};
use crate::error::{DiscoveryError, Result};

/// Parallelism of outbound query fan-out.
pub const ALPHA: usize = 3;

/// Bound on the routing table view.
const MAX_TABLE_ENTRIES: usize = 256;

/// How long an announcement entry stays fresh.
const ANNOUNCEMENT_TTL: Duration = Duration::from_secs(30 * 60);

/// Deadline for a single outbound query exchange.
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle deadline for an inbound DHT channel.
const CHANNEL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Derive a node id from a bind endpoint.
#[must_use]
pub fn node_id_for_endpoint(endpoint: &Endpoint) -> [u8; 32] {
    let mut encoded = Vec::with_capacity(24);
    endpoint.encode(&mut encoded);
    let mut hasher = blake3::Hasher::new();
    hasher.update(&encoded);
    hasher.update(b"trellis-dht-node-id");
    *hasher.finalize().as_bytes()
}

fn xor_distance(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

/// A known DHT node.
#[derive(Debug, Clone)]
pub struct DhtPeer {
    /// The node's DHT endpoint
    pub endpoint: Endpoint,
    /// Id derived from the endpoint
    pub id: [u8; 32],
    /// When the node was last seen
    pub last_seen: Instant,
}

/// Dials a DHT channel to a remote node's endpoint.
///
/// Each transport supplies its own mechanism: plain TCP on local segments,
/// decoy + version-0 shunt on the internet transports, SOCKS on the overlay.
#[async_trait]
pub trait DhtConnector: Send + Sync {
    /// Open a ready-to-use DHT channel to `endpoint`.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn PeerStream>>;
}

struct NodeInner {
    kind: TransportKind,
    bind_endpoint: Mutex<Endpoint>,
    id: Mutex<[u8; 32]>,
    table: Mutex<Vec<DhtPeer>>,
    announcements: Mutex<HashMap<NetworkId, HashMap<Endpoint, Instant>>>,
    connector: Arc<dyn DhtConnector>,
}

/// Handle to one transport-scoped DHT node.
#[derive(Clone)]
pub struct DhtNode {
    inner: Arc<NodeInner>,
}

impl DhtNode {
    /// Create a node for `kind`, identified by `bind_endpoint`.
    #[must_use]
    pub fn new(kind: TransportKind, bind_endpoint: Endpoint, connector: Arc<dyn DhtConnector>) -> Self {
        let id = node_id_for_endpoint(&bind_endpoint);
        Self {
            inner: Arc::new(NodeInner {
                kind,
                bind_endpoint: Mutex::new(bind_endpoint),
                id: Mutex::new(id),
                table: Mutex::new(Vec::new()),
                announcements: Mutex::new(HashMap::new()),
                connector,
            }),
        }
    }

    /// The transport this node serves.
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        self.inner.kind
    }

    /// The node's own DHT endpoint.
    #[must_use]
    pub fn bind_endpoint(&self) -> Endpoint {
        self.inner.bind_endpoint.lock().unwrap().clone()
    }

    /// The node's id.
    #[must_use]
    pub fn id(&self) -> [u8; 32] {
        *self.inner.id.lock().unwrap()
    }

    /// Insert a discovered node endpoint, ignoring self and duplicates.
    pub fn add_node(&self, endpoint: Endpoint) {
        if endpoint == self.bind_endpoint() {
            return;
        }
        let id = node_id_for_endpoint(&endpoint);
        let own_id = self.id();
        let mut table = self.inner.table.lock().unwrap();
        if let Some(existing) = table.iter_mut().find(|p| p.endpoint == endpoint) {
            existing.last_seen = Instant::now();
            return;
        }
        table.push(DhtPeer { endpoint, id, last_seen: Instant::now() });
        if table.len() > MAX_TABLE_ENTRIES {
            // Evict the entry farthest from our own id.
            table.sort_by(|a, b| xor_distance(&a.id, &own_id).cmp(&xor_distance(&b.id, &own_id)));
            table.truncate(MAX_TABLE_ENTRIES);
        }
    }

    /// Number of known nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.inner.table.lock().unwrap().len()
    }

    /// Up to `count` known nodes closest to `target` by XOR distance.
    #[must_use]
    pub fn closest_nodes(&self, target: &[u8; 32], count: usize) -> Vec<DhtPeer> {
        let mut nodes: Vec<DhtPeer> = self.inner.table.lock().unwrap().clone();
        nodes.sort_by(|a, b| xor_distance(&a.id, target).cmp(&xor_distance(&b.id, target)));
        nodes.truncate(count);
        nodes
    }

    /// Up to `count` uniformly sampled known nodes.
    #[must_use]
    pub fn random_nodes(&self, count: usize) -> Vec<DhtPeer> {
        use rand::seq::SliceRandom;
        let table = self.inner.table.lock().unwrap();
        table
            .choose_multiple(&mut rand::thread_rng(), count)
            .cloned()
            .collect()
    }

    /// Record an announcement, substituting an unspecified announced IP with
    /// the observed source address.
    fn store_announcement(&self, network: NetworkId, announced: Endpoint, source: &Endpoint) {
        let endpoint = match announced.ip() {
            Some(ip) if ip.is_unspecified() => match source.ip() {
                Some(src) => Endpoint::new(src, announced.port()),
                None => announced,
            },
            _ => announced,
        };
        let mut store = self.inner.announcements.lock().unwrap();
        store.entry(network).or_default().insert(endpoint, Instant::now());
    }

    /// Fresh announcements for `network`, expiring stale entries in place.
    fn fresh_announcements(&self, network: &NetworkId) -> Vec<Endpoint> {
        let mut store = self.inner.announcements.lock().unwrap();
        let Some(entries) = store.get_mut(network) else {
            return Vec::new();
        };
        entries.retain(|_, seen| seen.elapsed() < ANNOUNCEMENT_TTL);
        let fresh = entries.keys().cloned().collect();
        if entries.is_empty() {
            store.remove(network);
        }
        fresh
    }

    /// Query the network for peers announced under `network`.
    ///
    /// Dials up to [`ALPHA`] closest known nodes concurrently and merges
    /// their answers with the local store. Individual dial failures are
    /// logged and skipped.
    pub async fn find_peers(&self, network: &NetworkId) -> Vec<Endpoint> {
        self.run_query(network, None).await
    }

    /// Publish `self_endpoint` under `network`, then query, so announce
    /// returns the peers visible at the contacted nodes.
    pub async fn announce(&self, network: &NetworkId, self_endpoint: &Endpoint) -> Vec<Endpoint> {
        self.run_query(network, Some(self_endpoint.clone())).await
    }

    async fn run_query(&self, network: &NetworkId, announce: Option<Endpoint>) -> Vec<Endpoint> {
        let targets = self.closest_nodes(network.as_bytes(), ALPHA);
        let mut results: Vec<Endpoint> = self.fresh_announcements(network);

        let mut queries = Vec::with_capacity(targets.len());
        for peer in targets {
            let node = self.clone();
            let network = *network;
            let announce = announce.clone();
            queries.push(tokio::spawn(async move {
                match node.query_one(&peer.endpoint, &network, announce).await {
                    Ok(endpoints) => endpoints,
                    Err(err) => {
                        tracing::debug!(
                            transport = %node.kind(),
                            peer = %peer.endpoint,
                            "DHT query failed: {err}"
                        );
                        Vec::new()
                    }
                }
            }));
        }

        for query in queries {
            if let Ok(endpoints) = query.await {
                for endpoint in endpoints {
                    if !results.contains(&endpoint) {
                        results.push(endpoint);
                    }
                }
            }
        }
        results
    }

    async fn query_one(
        &self,
        target: &Endpoint,
        network: &NetworkId,
        announce: Option<Endpoint>,
    ) -> Result<Vec<Endpoint>> {
        let exchange = async {
            let mut stream = self.inner.connector.connect(target).await?;
            if let Some(endpoint) = announce {
                write_message(&mut stream, &DhtMessage::Announce { network: *network, endpoint })
                    .await?;
            }
            write_message(&mut stream, &DhtMessage::FindPeers { network: *network }).await?;
            loop {
                match read_message(&mut stream).await? {
                    DhtMessage::Peers { network: answered, endpoints } if answered == *network => {
                        return Ok(endpoints);
                    }
                    DhtMessage::Pong => continue,
                    _ => return Err(DiscoveryError::malformed("unexpected DHT answer")),
                }
            }
        };
        timeout(QUERY_TIMEOUT, exchange)
            .await
            .map_err(|_| DiscoveryError::QueryTimeout)?
    }

    /// Serve an inbound DHT channel until EOF or idle timeout.
    ///
    /// Never propagates; channel errors only end this stream.
    pub async fn serve_stream(&self, mut stream: Box<dyn PeerStream>, remote: Endpoint) {
        loop {
            let message = match timeout(CHANNEL_IDLE_TIMEOUT, read_message(&mut stream)).await {
                Ok(Ok(message)) => message,
                Ok(Err(_)) | Err(_) => return,
            };

            let reply = match message {
                DhtMessage::Ping => Some(DhtMessage::Pong),
                DhtMessage::FindPeers { network } => Some(DhtMessage::Peers {
                    network,
                    endpoints: self.fresh_announcements(&network),
                }),
                DhtMessage::Announce { network, endpoint } => {
                    self.store_announcement(network, endpoint, &remote);
                    None
                }
                DhtMessage::FindNode { target } => Some(DhtMessage::Nodes {
                    endpoints: self
                        .closest_nodes(&target, ALPHA * 2)
                        .into_iter()
                        .map(|p| p.endpoint)
                        .collect(),
                }),
                DhtMessage::Peers { .. } | DhtMessage::Nodes { .. } | DhtMessage::Pong => None,
            };

            if let Some(reply) = reply {
                if write_message(&mut stream, &reply).await.is_err() {
                    return;
                }
            }
        }
    }

    /// Rebind the node's identity endpoint (overlay hidden-service bring-up).
    pub fn set_bind_endpoint(&self, endpoint: Endpoint) {
        *self.inner.id.lock().unwrap() = node_id_for_endpoint(&endpoint);
        *self.inner.bind_endpoint.lock().unwrap() = endpoint;
    }
}

impl std::fmt::Debug for DhtNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhtNode")
            .field("kind", &self.inner.kind)
            .field("endpoint", &self.bind_endpoint())
            .field("nodes", &self.node_count())
            .finish()
    }
}
