//! The mesh node: orchestration of listeners, discovery, reachability,
//! and relays.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use trellis_discovery::{DhtConfig, DhtManager, DiscoveryCallback, LocalInbound, OverlayDhtConfig};
use trellis_transport::{
    connect_timeout_for, exchange_decoy, DecoyRole, Dialer, Endpoint, NetworkId, PeerId,
    PeerStream,
};

use super::config::{NodeConfig, OverlayMode};
use super::connection::{Connection, InFlightTable};
use super::error::{NodeError, Result};
use super::handshake::{self, DhtDispatch, HandshakeContext};
use super::overlay::OverlayAdapter;
use super::probes::WebProbe;
use super::reachability::{
    ReachabilityMonitor, ReachabilityStatus, SystemInterfaceSource, UpnpStatus,
};
use super::registry::ConnectionRegistry;
use super::relay::{RelayCoordinator, TunnelDialer};
use super::upnp::IgdProvider;

struct NodeInner {
    peer_id: PeerId,
    config: NodeConfig,
    registry: Arc<ConnectionRegistry>,
    in_flight_real: InFlightTable,
    in_flight_virtual: InFlightTable,
    relay: RelayCoordinator,
    service_port: AtomicU16,
    running: AtomicBool,
    dialer: Mutex<Dialer>,
    dht: Mutex<Option<DhtManager>>,
    reachability: Mutex<Option<ReachabilityMonitor>>,
    overlay: Mutex<Option<OverlayAdapter>>,
    tunnel_dialer: Mutex<Option<Arc<dyn TunnelDialer>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A Trellis mesh node.
///
/// Handles are cheap clones over shared state, the way background loops
/// borrow the node they serve.
#[derive(Clone)]
pub struct MeshNode {
    inner: Arc<NodeInner>,
}

impl MeshNode {
    /// Create a node with a fresh random peer id.
    #[must_use]
    pub fn new(config: NodeConfig) -> Self {
        let peer_id = PeerId::random();
        Self {
            inner: Arc::new(NodeInner {
                peer_id,
                registry: Arc::new(ConnectionRegistry::new(peer_id)),
                in_flight_real: InFlightTable::new(),
                in_flight_virtual: InFlightTable::new(),
                relay: RelayCoordinator::new(&config.relay),
                service_port: AtomicU16::new(config.local_port),
                running: AtomicBool::new(false),
                dialer: Mutex::new(Dialer::default()),
                dht: Mutex::new(None),
                reachability: Mutex::new(None),
                overlay: Mutex::new(None),
                tunnel_dialer: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                config,
            }),
        }
    }

    /// Our own peer id.
    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    /// The effective TCP service port (resolved after `start` when the
    /// configured port was 0).
    #[must_use]
    pub fn service_port(&self) -> u16 {
        self.inner.service_port.load(Ordering::Acquire)
    }

    /// The connection registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.inner.registry
    }

    /// The relay coordinator.
    #[must_use]
    pub fn relay(&self) -> &RelayCoordinator {
        &self.inner.relay
    }

    /// Supply the application's tunnel-dialing implementation, enabling
    /// virtual connections.
    pub fn set_tunnel_dialer(&self, dialer: Arc<dyn TunnelDialer>) {
        *self.inner.tunnel_dialer.lock().unwrap() = Some(dialer);
    }

    /// Start the node: overlay controller (when enabled), service
    /// listeners, DHT manager, reachability timer, relay fill timer.
    ///
    /// # Errors
    ///
    /// Fails when the node is already running, the overlay controller does
    /// not come up, or no listener can be bound.
    pub async fn start(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NodeError::invalid_state("node already running"));
        }
        let config = &self.inner.config;
        tracing::info!(peer = %self.inner.peer_id, "starting mesh node");

        // 1. Overlay controller first; its endpoints feed the dialer and
        //    the DHT manager.
        let overlay_dht = if config.overlay_mode != OverlayMode::Disabled {
            let adapter = OverlayAdapter::start(&config.overlay, config.local_port).await?;
            let settings = OverlayDhtConfig {
                socks: adapter.socks_endpoint(),
                self_endpoint: adapter.hidden_service_endpoint(),
            };
            *self.inner.overlay.lock().unwrap() = Some(adapter);
            Some(settings)
        } else {
            None
        };

        *self.inner.dialer.lock().unwrap() = Dialer {
            proxy: config.proxy.clone(),
            overlay_socks: overlay_dht.as_ref().map(|o| o.socks),
            overlay_only: config.overlay_mode == OverlayMode::Only,
        };

        // 2. Service listeners.
        let listeners = trellis_transport::listen(config.local_port).await?;
        let effective_port = listeners[0]
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(config.local_port);
        self.inner.service_port.store(effective_port, Ordering::Release);

        // 3. DHT manager, fed by the local-segment accept channel.
        let (local_tx, mut local_rx) = mpsc::channel::<LocalInbound>(64);
        let dht = DhtManager::new(
            DhtConfig {
                service_port: effective_port,
                bootstrap_url: config.bootstrap_url.clone(),
                bootstrap_endpoints: config.bootstrap_endpoints.clone(),
                enable_local_discovery: config.enable_local_discovery,
                proxy: config.proxy.clone(),
                overlay: overlay_dht,
            },
            local_tx,
        );
        *self.inner.dht.lock().unwrap() = Some(dht.clone());

        let mut tasks = Vec::new();

        // Local-segment streams skip the decoy; the segment is private.
        {
            let node = self.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(inbound) = local_rx.recv().await {
                    let node = node.clone();
                    tokio::spawn(async move {
                        let remote = Endpoint::from_socket_addr(inbound.remote);
                        let dispatch = DhtDispatch::Local(inbound.dht);
                        let ctx = node.handshake_context();
                        match handshake::accept(
                            Box::new(inbound.stream),
                            remote.clone(),
                            &ctx,
                            &dispatch,
                            false,
                        )
                        .await
                        {
                            Ok(_) => {}
                            Err(err) => {
                                tracing::debug!(remote = %remote, "local accept failed: {err}");
                            }
                        }
                    });
                }
            }));
        }

        // Internet listeners run the server-side decoy before the version
        // byte.
        for listener in listeners {
            let node = self.clone();
            let dht = dht.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let (stream, remote) = match listener.accept().await {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            tracing::debug!("accept error: {err}");
                            continue;
                        }
                    };
                    let node = node.clone();
                    let dht = dht.clone();
                    tokio::spawn(async move {
                        let remote = Endpoint::from_socket_addr(remote);
                        let mut stream: Box<dyn PeerStream> = Box::new(stream);
                        if let Err(err) =
                            exchange_decoy(&mut stream, DecoyRole::Server, "").await
                        {
                            tracing::debug!(remote = %remote, "decoy failed: {err}");
                            return;
                        }
                        let dispatch = DhtDispatch::Internet(dht);
                        let ctx = node.handshake_context();
                        match handshake::accept(stream, remote.clone(), &ctx, &dispatch, false)
                            .await
                        {
                            Ok(_) => {}
                            Err(err) => {
                                tracing::debug!(remote = %remote, "inbound handshake failed: {err}");
                            }
                        }
                    });
                }
            }));
        }

        // 4. Reachability monitor.
        let monitor = ReachabilityMonitor::new(
            effective_port,
            config.enable_upnp,
            config.proxy.clone(),
            config.connectivity.clone(),
            Arc::new(WebProbe::new(config.connectivity.clone())),
            Arc::new(IgdProvider),
            Arc::new(SystemInterfaceSource),
        );
        if config.connectivity.enabled {
            monitor.start();
        }
        *self.inner.reachability.lock().unwrap() = Some(monitor);

        // 5. Relay-client fill timer.
        {
            let node = self.clone();
            let dht = dht.clone();
            let interval = config.relay.fill_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    node.fill_relay_clients(&dht).await;
                }
            }));
        }

        self.inner.tasks.lock().unwrap().extend(tasks);
        tracing::info!(port = effective_port, "mesh node started");
        Ok(())
    }

    fn handshake_context(&self) -> HandshakeContext {
        HandshakeContext {
            registry: Arc::clone(&self.inner.registry),
            local_peer: self.inner.peer_id,
            local_port: self.service_port(),
        }
    }

    fn dht_manager(&self) -> Result<DhtManager> {
        self.inner.dht.lock().unwrap().clone().ok_or(NodeError::Disposed)
    }

    /// Establish (or return the existing) connection to `endpoint`.
    ///
    /// Concurrent calls to the same endpoint coalesce: one dials, the rest
    /// wait and re-check the registry.
    ///
    /// # Errors
    ///
    /// Transport failures, handshake failures, `ConnectInProgress` when a
    /// waiter times out without a usable record appearing.
    pub async fn make_connection(&self, endpoint: &Endpoint) -> Result<Arc<Connection>> {
        if !self.inner.running.load(Ordering::Acquire) {
            return Err(NodeError::Disposed);
        }
        if let Some(existing) = self.inner.registry.get_by_endpoint(endpoint) {
            if !existing.is_disposed() {
                return Ok(existing);
            }
        }

        let dialer = self.inner.dialer.lock().unwrap().clone();
        let deadline = connect_timeout_for(dialer.classify(endpoint));

        let Some(_guard) = self.inner.in_flight_real.begin(endpoint) else {
            self.inner.in_flight_real.wait_clear(endpoint, deadline).await?;
            return self
                .inner
                .registry
                .get_by_endpoint(endpoint)
                .filter(|conn| !conn.is_disposed())
                .ok_or(NodeError::ConnectInProgress);
        };

        let mut stream = dialer.connect(endpoint).await?;
        let host = format!("{}:{}", endpoint.host_string(), endpoint.port());
        exchange_decoy(&mut stream, DecoyRole::Client, &host).await?;

        match handshake::initiate(stream, endpoint.clone(), &self.handshake_context(), false).await
        {
            Err(NodeError::DuplicateRejected) => {
                // The peer's crossing handshake may still be mid-insert;
                // give it one more window before giving up.
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                self.inner
                    .registry
                    .get_by_endpoint(endpoint)
                    .filter(|conn| !conn.is_disposed())
                    .ok_or(NodeError::DuplicateRejected)
            }
            other => other,
        }
    }

    /// Establish a virtual connection to `target` tunneled through an
    /// established relay connection.
    ///
    /// # Errors
    ///
    /// `Disposed` without a tunnel dialer; otherwise as
    /// [`MeshNode::make_connection`].
    pub async fn make_virtual_connection(
        &self,
        target: &Endpoint,
        relay: &Arc<Connection>,
    ) -> Result<Arc<Connection>> {
        if !self.inner.running.load(Ordering::Acquire) {
            return Err(NodeError::Disposed);
        }
        let tunnel_dialer = self
            .inner
            .tunnel_dialer
            .lock()
            .unwrap()
            .clone()
            .ok_or(NodeError::Disposed)?;

        if let Some(existing) = self.inner.registry.get_by_endpoint(target) {
            if !existing.is_disposed() {
                return Ok(existing);
            }
        }

        let deadline = connect_timeout_for(trellis_transport::TransportKind::AnonymityOverlay);
        let Some(_guard) = self.inner.in_flight_virtual.begin(target) else {
            self.inner.in_flight_virtual.wait_clear(target, deadline).await?;
            return self
                .inner
                .registry
                .get_by_endpoint(target)
                .filter(|conn| !conn.is_disposed())
                .ok_or(NodeError::ConnectInProgress);
        };

        let stream = tunnel_dialer.open_tunnel(relay, target).await?;
        let connection =
            handshake::initiate(stream, target.clone(), &self.handshake_context(), true).await?;
        connection.set_via_relay(relay);
        Ok(connection)
    }

    /// Remove a connection from the registry and every relay table, then
    /// close its stream. Tunnels running through the connection are
    /// disposed with it.
    pub fn dispose_connection(&self, connection: &Arc<Connection>) {
        self.inner.registry.remove(connection);
        self.inner.relay.forget(connection);
        connection.close();

        let dependent: Vec<_> = self
            .inner
            .registry
            .connections()
            .into_iter()
            .filter(|c| c.is_virtual() && c.is_via_relay(connection))
            .collect();
        for tunnel in dependent {
            tracing::debug!(peer = %tunnel.peer_id(), "closing tunnel with its relay");
            self.dispose_connection(&tunnel);
        }
    }

    /// Fan out a find-peers query for `network`. See
    /// [`DhtManager::begin_find_peers`].
    ///
    /// # Errors
    ///
    /// `Disposed` before `start`.
    pub fn find_mesh_peers(
        &self,
        network: NetworkId,
        local_only: bool,
        callback: DiscoveryCallback,
    ) -> Result<()> {
        self.dht_manager()?.begin_find_peers(network, local_only, callback);
        Ok(())
    }

    /// Fan out an announce for `network`, publishing this node's service
    /// endpoint (receivers substitute the observed source address).
    ///
    /// # Errors
    ///
    /// `Disposed` before `start`.
    pub fn announce_mesh_network(
        &self,
        network: NetworkId,
        local_only: bool,
        callback: DiscoveryCallback,
    ) -> Result<()> {
        let endpoint = Endpoint::V4(std::net::Ipv4Addr::UNSPECIFIED, self.service_port());
        self.dht_manager()?.begin_announce(network, local_only, endpoint, callback);
        Ok(())
    }

    /// Register `connection` as a relay consumer for `network` and announce
    /// this node as its relay.
    ///
    /// # Errors
    ///
    /// `Disposed` before `start`.
    pub fn host_relayed_network(
        &self,
        network: NetworkId,
        connection: &Arc<Connection>,
    ) -> Result<()> {
        let dht = self.dht_manager()?;
        self.inner
            .relay
            .register_hosted_network(network, connection, &dht, self.service_port());
        Ok(())
    }

    async fn fill_relay_clients(&self, dht: &DhtManager) {
        let deficit = self.inner.relay.client_deficit();
        if deficit == 0 {
            return;
        }
        let candidates = dht.random_ipv4_nodes(deficit * 2);
        if candidates.is_empty() {
            return;
        }
        tracing::debug!(deficit, candidates = candidates.len(), "filling relay clients");

        let mut dials = Vec::new();
        for candidate in candidates {
            let node = self.clone();
            dials.push(tokio::spawn(async move {
                match node.make_connection(&candidate.endpoint).await {
                    Ok(connection) => {
                        if !node.inner.relay.try_adopt_client(&connection) {
                            tracing::trace!(
                                endpoint = %candidate.endpoint,
                                "relay pool filled, discarding win"
                            );
                        }
                    }
                    Err(err) => {
                        tracing::debug!(endpoint = %candidate.endpoint, "relay dial failed: {err}");
                    }
                }
            }));
        }
        for dial in dials {
            let _ = dial.await;
        }
    }

    /// Current IPv4 reachability classification.
    #[must_use]
    pub fn ipv4_status(&self) -> ReachabilityStatus {
        self.monitor_status(|m| m.ipv4_status())
    }

    /// Current IPv6 reachability classification.
    #[must_use]
    pub fn ipv6_status(&self) -> ReachabilityStatus {
        self.monitor_status(|m| m.ipv6_status())
    }

    /// Current UPnP sub-state.
    #[must_use]
    pub fn upnp_status(&self) -> UpnpStatus {
        self.inner
            .reachability
            .lock()
            .unwrap()
            .as_ref()
            .map(|m| m.upnp_status())
            .unwrap_or(UpnpStatus::Identifying)
    }

    /// The advertisable IPv4 endpoint, when one is known.
    #[must_use]
    pub fn ipv4_external_endpoint(&self) -> Option<Endpoint> {
        self.inner
            .reachability
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|m| m.ipv4_external_endpoint())
    }

    /// The advertisable IPv6 endpoint, when one is known.
    #[must_use]
    pub fn ipv6_external_endpoint(&self) -> Option<Endpoint> {
        self.inner
            .reachability
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|m| m.ipv6_external_endpoint())
    }

    /// Run a one-shot reachability check now.
    pub async fn recheck_connectivity(&self) {
        let monitor = self.inner.reachability.lock().unwrap().clone();
        if let Some(monitor) = monitor {
            monitor.recheck_connectivity().await;
        }
    }

    fn monitor_status(
        &self,
        read: impl Fn(&ReachabilityMonitor) -> ReachabilityStatus,
    ) -> ReachabilityStatus {
        self.inner
            .reachability
            .lock()
            .unwrap()
            .as_ref()
            .map(read)
            .unwrap_or(ReachabilityStatus::Identifying)
    }

    /// Stop everything in reverse dependency order; the overlay controller
    /// goes down last.
    pub async fn shutdown(&self) {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        tracing::info!(peer = %self.inner.peer_id, "shutting down mesh node");

        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        if let Some(monitor) = self.inner.reachability.lock().unwrap().take() {
            monitor.stop();
        }
        if let Some(dht) = self.inner.dht.lock().unwrap().take() {
            dht.dispose();
        }
        for connection in self.inner.registry.connections() {
            self.dispose_connection(&connection);
        }
        let overlay = self.inner.overlay.lock().unwrap().take();
        if let Some(overlay) = overlay {
            overlay.shutdown().await;
        }
    }
}

impl std::fmt::Debug for MeshNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshNode")
            .field("peer", &self.inner.peer_id)
            .field("port", &self.service_port())
            .field("connections", &self.inner.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_double_start_rejected() {
        let config = NodeConfig {
            enable_local_discovery: false,
            connectivity: crate::node::config::ConnectivityConfig {
                enabled: false,
                ..Default::default()
            },
            ..NodeConfig::default()
        };
        let node = MeshNode::new(config);
        node.start().await.unwrap();
        assert!(node.start().await.is_err());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_make_connection_before_start_is_disposed() {
        let node = MeshNode::new(NodeConfig::default());
        let err = node
            .make_connection(&Endpoint::new("127.0.0.1".parse().unwrap(), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Disposed));
    }

    #[tokio::test]
    async fn test_status_identifying_before_start() {
        let node = MeshNode::new(NodeConfig::default());
        assert_eq!(node.ipv4_status(), ReachabilityStatus::Identifying);
        assert_eq!(node.upnp_status(), UpnpStatus::Identifying);
        assert!(node.ipv4_external_endpoint().is_none());
    }
}
