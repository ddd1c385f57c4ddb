//! The DHT manager.
//!
//! Owns the three transport-scoped DHT nodes, seeds them from configured and
//! fetched bootstrap endpoints, fans find/announce queries out across every
//! enabled transport, and keeps one [`LocalNetworkDhtManager`] per live
//! non-loopback interface through a 15-second network watcher.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use trellis_transport::{
    exchange_decoy, AddressFamily, DecoyRole, Dialer, Endpoint, NetworkId, PeerStream,
    ProxyConfig, TransportKind,
};

use crate::dht::{DhtConnector, DhtNode, DhtPeer, DHT_CHANNEL_SHUNT};
use crate::error::{DiscoveryError, Result};
use crate::local::{LocalInbound, LocalNetworkDhtManager, NetworkInterfaceRecord};

/// Cadence of the interface watcher.
const WATCHER_INTERVAL: Duration = Duration::from_secs(15);

/// Result sink for a fan-out query: invoked once per transport that
/// produced a non-empty result.
pub type DiscoveryCallback = Arc<dyn Fn(TransportKind, Vec<Endpoint>) + Send + Sync>;

/// Overlay DHT settings, available once the overlay controller is up.
#[derive(Debug, Clone)]
pub struct OverlayDhtConfig {
    /// The controller's SOCKS endpoint for outbound tunnels
    pub socks: SocketAddr,
    /// This node's own hidden-service endpoint
    pub self_endpoint: Endpoint,
}

/// DHT manager configuration.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// The node's shared TCP service port
    pub service_port: u16,
    /// Well-known bootstrap blob URL, if any
    pub bootstrap_url: Option<String>,
    /// Statically configured bootstrap endpoints
    pub bootstrap_endpoints: Vec<Endpoint>,
    /// Whether local-segment discovery runs
    pub enable_local_discovery: bool,
    /// Egress proxy for internet DHT channels and the bootstrap fetch
    pub proxy: Option<ProxyConfig>,
    /// Overlay settings when the anonymity overlay is enabled
    pub overlay: Option<OverlayDhtConfig>,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            service_port: 41700,
            bootstrap_url: None,
            bootstrap_endpoints: Vec::new(),
            enable_local_discovery: true,
            proxy: None,
            overlay: None,
        }
    }
}

/// DHT connector for internet and overlay transports: dial through the
/// [`Dialer`], run the client decoy, then open the channel with the
/// version-0 shunt byte.
pub struct ShuntConnector {
    dialer: Dialer,
}

impl ShuntConnector {
    /// Wrap a dialer.
    #[must_use]
    pub fn new(dialer: Dialer) -> Self {
        Self { dialer }
    }
}

#[async_trait::async_trait]
impl DhtConnector for ShuntConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn PeerStream>> {
        let mut stream = self.dialer.connect(endpoint).await?;
        let host = format!("{}:{}", endpoint.host_string(), endpoint.port());
        exchange_decoy(&mut stream, DecoyRole::Client, &host).await?;
        stream.write_all(&[DHT_CHANNEL_SHUNT]).await?;
        stream.flush().await?;
        Ok(stream)
    }
}

struct ManagerInner {
    config: DhtConfig,
    ipv4: DhtNode,
    ipv6: DhtNode,
    overlay: Option<DhtNode>,
    local: Mutex<Vec<LocalNetworkDhtManager>>,
    inbound_tx: mpsc::Sender<LocalInbound>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Owner of the per-transport DHT nodes and local-segment managers.
#[derive(Clone)]
pub struct DhtManager {
    inner: Arc<ManagerInner>,
}

impl DhtManager {
    /// Construct the manager and start its background work.
    ///
    /// Accepted local-segment TCP streams are forwarded through
    /// `inbound_tx` to the node's connection-initiate pipeline.
    #[must_use]
    pub fn new(config: DhtConfig, inbound_tx: mpsc::Sender<LocalInbound>) -> Self {
        let internet_dialer = Dialer {
            proxy: config.proxy.clone(),
            overlay_socks: config.overlay.as_ref().map(|o| o.socks),
            overlay_only: false,
        };
        let ipv4 = DhtNode::new(
            TransportKind::Ipv4Internet,
            Endpoint::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.service_port),
            Arc::new(ShuntConnector::new(internet_dialer.clone())),
        );
        let ipv6 = DhtNode::new(
            TransportKind::Ipv6Internet,
            Endpoint::new("::".parse().unwrap(), config.service_port),
            Arc::new(ShuntConnector::new(internet_dialer.clone())),
        );
        let overlay = config.overlay.as_ref().map(|overlay| {
            let overlay_dialer = Dialer {
                proxy: None,
                overlay_socks: Some(overlay.socks),
                overlay_only: true,
            };
            DhtNode::new(
                TransportKind::AnonymityOverlay,
                overlay.self_endpoint.clone(),
                Arc::new(ShuntConnector::new(overlay_dialer)),
            )
        });

        let manager = Self {
            inner: Arc::new(ManagerInner {
                config,
                ipv4,
                ipv6,
                overlay,
                local: Mutex::new(Vec::new()),
                inbound_tx,
                tasks: Mutex::new(Vec::new()),
            }),
        };

        let seeds = manager.inner.config.bootstrap_endpoints.clone();
        manager.seed(&seeds);

        if let Some(url) = manager.inner.config.bootstrap_url.clone() {
            let fetcher = manager.clone();
            let proxy = fetcher.inner.config.proxy.clone();
            let task = tokio::spawn(async move {
                match crate::bootstrap::fetch_bootstrap_endpoints(&url, proxy.as_ref()).await {
                    Ok(endpoints) => {
                        tracing::info!(count = endpoints.len(), "bootstrap blob fetched");
                        fetcher.seed(&endpoints);
                    }
                    Err(err) => {
                        tracing::warn!("bootstrap fetch failed: {err}");
                    }
                }
            });
            manager.inner.tasks.lock().unwrap().push(task);
        }

        if manager.inner.config.enable_local_discovery {
            let watcher = manager.clone();
            let task = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(WATCHER_INTERVAL);
                loop {
                    ticker.tick().await;
                    let snapshot = live_interface_records();
                    watcher.apply_interface_snapshot(snapshot).await;
                }
            });
            manager.inner.tasks.lock().unwrap().push(task);
        }

        manager
    }

    /// Dispatch endpoints into the node matching their family.
    pub fn seed(&self, endpoints: &[Endpoint]) {
        for endpoint in endpoints {
            match endpoint.family() {
                AddressFamily::Ipv4 => self.inner.ipv4.add_node(endpoint.clone()),
                AddressFamily::Ipv6 => self.inner.ipv6.add_node(endpoint.clone()),
                AddressFamily::Unspecified => {
                    if let Some(overlay) = &self.inner.overlay {
                        overlay.add_node(endpoint.clone());
                    } else {
                        tracing::debug!(endpoint = %endpoint, "dropping overlay seed, overlay disabled");
                    }
                }
            }
        }
    }

    /// The IPv4 internet DHT node.
    #[must_use]
    pub fn ipv4_node(&self) -> &DhtNode {
        &self.inner.ipv4
    }

    /// The IPv6 internet DHT node.
    #[must_use]
    pub fn ipv6_node(&self) -> &DhtNode {
        &self.inner.ipv6
    }

    /// The overlay DHT node, when the overlay is enabled.
    #[must_use]
    pub fn overlay_node(&self) -> Option<&DhtNode> {
        self.inner.overlay.as_ref()
    }

    /// Random IPv4 DHT nodes, used by the relay coordinator's fill timer.
    #[must_use]
    pub fn random_ipv4_nodes(&self, count: usize) -> Vec<DhtPeer> {
        self.inner.ipv4.random_nodes(count)
    }

    /// Dispatch concurrent find-peers queries, one per enabled transport and
    /// one per local-segment manager. `callback` fires once per transport
    /// that returned a non-empty result; there is no global aggregation.
    pub fn begin_find_peers(&self, network: NetworkId, local_only: bool, callback: DiscoveryCallback) {
        self.fan_out(network, local_only, callback);
    }

    /// Dispatch concurrent announce queries publishing `self_endpoint`.
    ///
    /// The anonymity-overlay branch performs a find rather than an announce;
    /// overlay peers are learned passively through their own queries.
    pub fn begin_announce(
        &self,
        network: NetworkId,
        local_only: bool,
        self_endpoint: Endpoint,
        callback: DiscoveryCallback,
    ) {
        self.fan_out_announce(network, local_only, self_endpoint, callback);
    }

    fn fan_out(&self, network: NetworkId, local_only: bool, callback: DiscoveryCallback) {
        if !local_only {
            for node in self.internet_and_overlay_nodes() {
                let callback = Arc::clone(&callback);
                tokio::spawn(async move {
                    let peers = node.find_peers(&network).await;
                    if !peers.is_empty() {
                        callback(node.kind(), peers);
                    }
                });
            }
        }
        for dht in self.local_dht_nodes() {
            let callback = Arc::clone(&callback);
            tokio::spawn(async move {
                let peers = dht.find_peers(&network).await;
                if !peers.is_empty() {
                    callback(TransportKind::LocalNetwork, peers);
                }
            });
        }
    }

    fn fan_out_announce(
        &self,
        network: NetworkId,
        local_only: bool,
        self_endpoint: Endpoint,
        callback: DiscoveryCallback,
    ) {
        if !local_only {
            for node in self.internet_and_overlay_nodes() {
                let callback = Arc::clone(&callback);
                let self_endpoint = self_endpoint.clone();
                tokio::spawn(async move {
                    let peers = match node.kind() {
                        TransportKind::AnonymityOverlay => node.find_peers(&network).await,
                        _ => node.announce(&network, &self_endpoint).await,
                    };
                    if !peers.is_empty() {
                        callback(node.kind(), peers);
                    }
                });
            }
        }
        for dht in self.local_dht_nodes() {
            let callback = Arc::clone(&callback);
            let self_endpoint = self_endpoint.clone();
            tokio::spawn(async move {
                let peers = dht.announce(&network, &self_endpoint).await;
                if !peers.is_empty() {
                    callback(TransportKind::LocalNetwork, peers);
                }
            });
        }
    }

    fn internet_and_overlay_nodes(&self) -> Vec<DhtNode> {
        let mut nodes = vec![self.inner.ipv4.clone(), self.inner.ipv6.clone()];
        if let Some(overlay) = &self.inner.overlay {
            nodes.push(overlay.clone());
        }
        nodes
    }

    fn local_dht_nodes(&self) -> Vec<DhtNode> {
        self.inner
            .local
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.dht().clone())
            .collect()
    }

    /// Hand an inbound DHT channel (already past the shunt byte) to the
    /// node matching the remote's address family.
    ///
    /// # Errors
    ///
    /// `UnsupportedFamily` when no node serves the family.
    pub fn accept_internet_dht_connection(
        &self,
        stream: Box<dyn PeerStream>,
        remote: Endpoint,
    ) -> Result<()> {
        let node = match remote.family() {
            AddressFamily::Ipv4 => self.inner.ipv4.clone(),
            AddressFamily::Ipv6 => self.inner.ipv6.clone(),
            AddressFamily::Unspecified => self
                .inner
                .overlay
                .clone()
                .ok_or(DiscoveryError::UnsupportedFamily)?,
        };
        tokio::spawn(async move {
            node.serve_stream(stream, remote).await;
        });
        Ok(())
    }

    /// Reconcile local-segment managers against an interface snapshot.
    ///
    /// Managers whose interface disappeared are disposed; every live record
    /// without a manager gets one. Identity is local-IP equality, and the
    /// add path re-checks the managed set explicitly rather than trusting
    /// the diff that woke it.
    pub async fn apply_interface_snapshot(&self, snapshot: Vec<NetworkInterfaceRecord>) {
        let (removed, added) = {
            let mut managers = self.inner.local.lock().unwrap();
            let removed: Vec<IpAddr> = managers
                .iter()
                .filter(|m| !snapshot.iter().any(|r| r.local_ip == m.local_ip()))
                .map(|m| m.local_ip())
                .collect();
            managers.retain_mut(|m| {
                if removed.contains(&m.local_ip()) {
                    m.dispose();
                    false
                } else {
                    true
                }
            });

            let managed: Vec<IpAddr> = managers.iter().map(|m| m.local_ip()).collect();
            let added: Vec<NetworkInterfaceRecord> = snapshot
                .into_iter()
                .filter(|r| !managed.contains(&r.local_ip))
                .collect();
            (removed, added)
        };

        for ip in removed {
            tracing::info!(interface = %ip, "interface gone, local discovery stopped");
        }

        for record in added {
            // Not-already-managed was checked above under the lock; re-check
            // here in case a concurrent snapshot won the race.
            if self
                .inner
                .local
                .lock()
                .unwrap()
                .iter()
                .any(|m| m.local_ip() == record.local_ip)
            {
                continue;
            }
            match LocalNetworkDhtManager::new(record.clone(), self.inner.inbound_tx.clone()).await {
                Ok(manager) => {
                    self.inner.local.lock().unwrap().push(manager);
                }
                Err(err) => {
                    tracing::warn!(interface = %record.local_ip, "local discovery failed: {err}");
                }
            }
        }
    }

    /// IPs of the currently managed interfaces.
    #[must_use]
    pub fn managed_interfaces(&self) -> Vec<IpAddr> {
        self.inner
            .local
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.local_ip())
            .collect()
    }

    /// Stop the watcher, the bootstrap fetch, and every local manager.
    pub fn dispose(&self) {
        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        for manager in self.inner.local.lock().unwrap().iter_mut() {
            manager.dispose();
        }
        self.inner.local.lock().unwrap().clear();
    }
}

/// Snapshot the live non-loopback interface addresses.
#[must_use]
pub fn live_interface_records() -> Vec<NetworkInterfaceRecord> {
    let mut records = Vec::new();
    for iface in default_net::get_interfaces() {
        if iface.is_loopback() || !iface.is_up() {
            continue;
        }
        let multicast = iface.is_multicast();
        for net in &iface.ipv4 {
            let broadcast = Ipv4Addr::from(u32::from(net.addr) | !u32::from(net.netmask));
            records.push(NetworkInterfaceRecord {
                local_ip: IpAddr::V4(net.addr),
                broadcast_ip: Some(broadcast),
                index: iface.index,
                multicast,
                up: true,
            });
        }
        for net in &iface.ipv6 {
            records.push(NetworkInterfaceRecord {
                local_ip: IpAddr::V6(net.addr),
                broadcast_ip: None,
                index: iface.index,
                multicast,
                up: true,
            });
        }
    }
    records
}

/// Pure diff between the managed set and a snapshot; the watcher applies
/// the same rule with disposal side effects.
#[must_use]
pub fn plan_interface_changes(
    managed: &[IpAddr],
    snapshot: &[NetworkInterfaceRecord],
) -> (Vec<IpAddr>, Vec<IpAddr>) {
    let to_remove = managed
        .iter()
        .filter(|ip| !snapshot.iter().any(|r| r.local_ip == **ip))
        .copied()
        .collect();
    let to_add = snapshot
        .iter()
        .filter(|r| !managed.contains(&r.local_ip))
        .map(|r| r.local_ip)
        .collect();
    (to_remove, to_add)
}
